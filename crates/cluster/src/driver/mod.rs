//! Drivers materialize a node as a VM, a container, a remote host or the
//! host itself.
//!
//! The registry describes every driver minikube knows by name. Drivers that
//! minikube implements itself (`none`, `ssh`, `docker`, `podman`) run
//! in-process; every other driver runs as a plugin process spoken to over
//! the `machine-rpc` protocol. Both are reached through the [`Driver`] sum
//! type, which implements [`DriverCapability`].
use std::fmt;
use std::time::Duration;

use machine_rpc::MachineState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{Cmd, ExecRunner, Runner};
use crate::config::{ClusterConfig, Node};
use crate::reason;

pub mod kic;
mod none;
mod plugin;
pub mod serve;
mod ssh;

pub use kic::KicDriver;
pub use none::NoneDriver;
pub use plugin::PluginDriver;
pub use serve::serve_plugin;
pub use ssh::SshDriver;

pub const DOCKER: &str = "docker";
pub const PODMAN: &str = "podman";
pub const NONE: &str = "none";
pub const SSH: &str = "ssh";
pub const KVM2: &str = "kvm2";
pub const QEMU2: &str = "qemu2";
pub const VIRTUALBOX: &str = "virtualbox";
pub const HYPERKIT: &str = "hyperkit";
pub const HYPERV: &str = "hyperv";
pub const VMWARE: &str = "vmware";
pub const PARALLELS: &str = "parallels";
pub const VFKIT: &str = "vfkit";
/// Legacy name of the container driver.
pub const KIC: &str = "kic";

/// How strongly a driver is recommended, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Unhealthy,
    Obsolete,
    Experimental,
    Discouraged,
    Fallback,
    Default,
    Preferred,
}

/// The kind of guest a driver creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Vm,
    Kic,
    BareMetal,
    Ssh,
}

/// A registry entry.
#[derive(Clone, Copy, Debug)]
pub struct DriverDef {
    pub name: &'static str,
    pub full_name: &'static str,
    pub family: Family,
    pub priority: Priority,
    /// Host operating systems the driver runs on.
    pub os: &'static [&'static str],
    /// An executable that must be on `PATH` for the driver to be usable.
    pub binary: Option<&'static str>,
    /// A command that must succeed for the driver to be healthy.
    pub probe: &'static [&'static str],
}

const ALL_OS: &[&str] = &["linux", "darwin", "windows"];

/// Every driver minikube can use.
pub const REGISTRY: &[DriverDef] = &[
    DriverDef {
        name: DOCKER,
        full_name: "Docker",
        family: Family::Kic,
        priority: Priority::Preferred,
        os: ALL_OS,
        binary: Some("docker"),
        probe: &["docker", "version", "--format", "{{.Server.Os}}-{{.Server.Version}}"],
    },
    DriverDef {
        name: PODMAN,
        full_name: "Podman",
        family: Family::Kic,
        priority: Priority::Experimental,
        os: &["linux"],
        binary: Some("podman"),
        probe: &["podman", "version", "--format", "{{.Version}}"],
    },
    DriverDef {
        name: KVM2,
        full_name: "KVM",
        family: Family::Vm,
        priority: Priority::Default,
        os: &["linux"],
        binary: Some("virsh"),
        probe: &["virsh", "domcapabilities", "--virttype", "kvm"],
    },
    DriverDef {
        name: QEMU2,
        full_name: "QEMU",
        family: Family::Vm,
        priority: Priority::Default,
        os: &["linux", "darwin"],
        binary: Some("qemu-system-x86_64"),
        probe: &[],
    },
    DriverDef {
        name: VIRTUALBOX,
        full_name: "VirtualBox",
        family: Family::Vm,
        priority: Priority::Fallback,
        os: ALL_OS,
        binary: Some("VBoxManage"),
        probe: &["VBoxManage", "list", "hostinfo"],
    },
    DriverDef {
        name: HYPERKIT,
        full_name: "HyperKit",
        family: Family::Vm,
        priority: Priority::Obsolete,
        os: &["darwin"],
        binary: Some("hyperkit"),
        probe: &[],
    },
    DriverDef {
        name: HYPERV,
        full_name: "Hyper-V",
        family: Family::Vm,
        priority: Priority::Preferred,
        os: &["windows"],
        binary: Some("powershell"),
        probe: &["powershell", "-NoProfile", "-NonInteractive", "@(Get-Wmiobject Win32_ComputerSystem).HypervisorPresent"],
    },
    DriverDef {
        name: VMWARE,
        full_name: "VMware",
        family: Family::Vm,
        priority: Priority::Default,
        os: ALL_OS,
        binary: Some("vmrun"),
        probe: &[],
    },
    DriverDef {
        name: PARALLELS,
        full_name: "Parallels",
        family: Family::Vm,
        priority: Priority::Default,
        os: &["darwin"],
        binary: Some("prlctl"),
        probe: &[],
    },
    DriverDef {
        name: VFKIT,
        full_name: "vfkit",
        family: Family::Vm,
        priority: Priority::Default,
        os: &["darwin"],
        binary: Some("vfkit"),
        probe: &[],
    },
    DriverDef {
        name: SSH,
        full_name: "SSH",
        family: Family::Ssh,
        priority: Priority::Discouraged,
        os: ALL_OS,
        binary: Some("ssh"),
        probe: &[],
    },
    DriverDef {
        name: NONE,
        full_name: "None",
        family: Family::BareMetal,
        priority: Priority::Discouraged,
        os: &["linux"],
        binary: None,
        probe: &[],
    },
];

/// Looks up a driver by name. `kic` is accepted as an alias of `docker`.
pub fn lookup(name: &str) -> Option<&'static DriverDef> {
    let name = if name == KIC { DOCKER } else { name };
    REGISTRY.iter().find(|d| d.name == name)
}

/// Whether `name` is a driver minikube knows on this host.
pub fn supported(name: &str) -> bool {
    supported_on(name, reason::host_os())
}

fn supported_on(name: &str, os: &str) -> bool {
    lookup(name).map_or(false, |d| d.os.contains(&os))
}

/// Every driver usable on this host, in registry order.
pub fn supported_drivers() -> Vec<&'static str> {
    drivers_for(reason::host_os())
}

fn drivers_for(os: &str) -> Vec<&'static str> {
    REGISTRY
        .iter()
        .filter(|d| d.os.contains(&os))
        .map(|d| d.name)
        .collect()
}

/// A bullet list of the drivers usable on `os`.
pub fn display_supported_drivers(os: &str) -> String {
    REGISTRY
        .iter()
        .filter(|d| d.os.contains(&os))
        .map(|d| {
            let note = match d.priority {
                Priority::Experimental => " (experimental)",
                Priority::Obsolete => " (obsolete)",
                _ => "",
            };
            format!("\t- {}{}", d.name, note)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the driver runs nodes as containers.
pub fn is_kic(name: &str) -> bool {
    lookup(name).map_or(false, |d| d.family == Family::Kic)
}

pub fn is_vm(name: &str) -> bool {
    lookup(name).map_or(false, |d| d.family == Family::Vm)
}

/// Whether the node is the host itself.
pub fn bare_metal(name: &str) -> bool {
    lookup(name).map_or(false, |d| d.family == Family::BareMetal)
}

pub fn is_ssh(name: &str) -> bool {
    lookup(name).map_or(false, |d| d.family == Family::Ssh)
}

/// Whether the driver can run more than one node.
pub fn allows_multi_node(name: &str) -> bool {
    !bare_metal(name) && !is_ssh(name)
}

/// Whether guest ports must be reached through ports published on the host
/// rather than the node IP.
pub fn needs_port_forward(name: &str) -> bool {
    is_kic(name) && (reason::host_os() != "linux" || kic::external_daemon(name))
}

/// The human readable name of a driver.
pub fn full_name(name: &str) -> &str {
    lookup(name).map_or(name, |d| d.full_name)
}

/// The outcome of probing a driver on this host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverState {
    pub name: &'static str,
    pub priority: Priority,
    pub installed: bool,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Probes whether a driver is installed and healthy.
pub async fn status(def: &'static DriverDef) -> DriverState {
    let mut state = DriverState {
        name: def.name,
        priority: def.priority,
        installed: true,
        healthy: true,
        error: None,
    };
    if let Some(bin) = def.binary {
        if which::which(bin).is_err() {
            state.installed = false;
            state.healthy = false;
            state.error = Some(format!("{} not found on PATH", bin));
            return state;
        }
    }
    if let Some((program, args)) = def.probe.split_first() {
        let runner = ExecRunner::default();
        let probe = runner.run(Cmd::new(*program).args(args.iter().copied()));
        match tokio::time::timeout(Duration::from_secs(8), probe).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                state.healthy = false;
                state.error = Some(format!("{:#}", e));
            }
            Err(_) => {
                state.healthy = false;
                state.error = Some(format!("{} did not respond in time", program));
            }
        }
    }
    state
}

/// Picks the driver to use.
///
/// An explicit request wins, as long as it does not contradict the driver
/// an existing profile was created with. Otherwise the existing driver is
/// reused, and for new profiles the highest priority healthy driver on this
/// host is detected.
pub async fn resolve(requested: &str, existing: Option<&str>, os: &str) -> anyhow::Result<String> {
    if let Some(old) = existing.filter(|d| !d.is_empty()) {
        if !requested.is_empty() && canonical(requested) != canonical(old) {
            return Err(reason::with_kind(
                reason::GUEST_DRIVER_MISMATCH,
                anyhow::anyhow!(
                    "the existing cluster was created using the {:?} driver, which is incompatible with the requested {:?} driver",
                    old,
                    requested
                ),
            ));
        }
        return Ok(canonical(old).to_string());
    }
    if !requested.is_empty() {
        if !supported_on(requested, os) {
            return Err(reason::with_kind(
                reason::DRV_UNSUPPORTED_OS,
                anyhow::anyhow!(
                    "the driver {:?} is not supported on {}. Supported drivers:\n{}",
                    requested,
                    os,
                    display_supported_drivers(os)
                ),
            ));
        }
        return Ok(canonical(requested).to_string());
    }

    let mut candidates: Vec<&'static DriverDef> = REGISTRY
        .iter()
        .filter(|d| d.os.contains(&os) && d.priority > Priority::Discouraged)
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut rejected = Vec::new();
    for def in candidates {
        let state = status(def).await;
        if state.healthy {
            info!(driver = def.name, "automatically selected driver");
            return Ok(def.name.to_string());
        }
        debug!(driver = def.name, error = ?state.error, "driver not usable");
        rejected.push(format!("{}: {}", def.name, state.error.unwrap_or_default()));
    }
    Err(reason::with_kind(
        reason::DRV_NOT_DETECTED,
        anyhow::anyhow!(
            "unable to pick a default driver. Here is what was considered, in preference order:\n{}",
            rejected.join("\n")
        ),
    ))
}

fn canonical(name: &str) -> &str {
    if name == KIC {
        DOCKER
    } else {
        name
    }
}

/// Driver errors callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("the driver {0:?} is not known")]
    NotFound(String),
    #[error("machine {0:?} does not exist")]
    MachineDoesNotExist(String),
    #[error("the {driver} driver does not support {operation}")]
    Unsupported {
        driver: String,
        operation: &'static str,
    },
    #[error(transparent)]
    Plugin(#[from] machine_rpc::RpcError),
}

/// Settings common to every driver, persisted as part of the raw driver
/// blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BaseDriver {
    pub machine_name: String,
    /// The minikube home the machine lives under.
    pub store_path: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "SSHUser")]
    pub ssh_user: String,
    #[serde(rename = "SSHPort")]
    pub ssh_port: u16,
    #[serde(rename = "SSHKeyPath")]
    pub ssh_key_path: String,
}

impl BaseDriver {
    pub fn new(machine_name: &str, store_path: &str) -> Self {
        BaseDriver {
            machine_name: machine_name.to_string(),
            store_path: store_path.to_string(),
            ssh_user: "docker".to_string(),
            ssh_port: 22,
            ..Default::default()
        }
    }

    /// The machine's directory under the store.
    pub fn machine_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.store_path)
            .join("machines")
            .join(&self.machine_name)
    }

    pub fn resolved_ssh_key_path(&self) -> String {
        if self.ssh_key_path.is_empty() {
            self.machine_dir().join("id_rsa").display().to_string()
        } else {
            self.ssh_key_path.clone()
        }
    }
}

/// The operations minikube performs on a machine.
#[async_trait::async_trait]
pub trait DriverCapability: Send + Sync {
    fn driver_name(&self) -> String;
    async fn pre_create_check(&mut self) -> anyhow::Result<()>;
    async fn create(&mut self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()>;
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
    async fn restart(&mut self) -> anyhow::Result<()> {
        self.stop().await?;
        self.start().await
    }
    async fn remove(&mut self) -> anyhow::Result<()>;
    async fn kill(&mut self) -> anyhow::Result<()>;
    async fn ip(&self) -> anyhow::Result<String>;
    async fn ssh_hostname(&self) -> anyhow::Result<String>;
    async fn ssh_port(&self) -> anyhow::Result<u16>;
    async fn ssh_key_path(&self) -> anyhow::Result<String>;
    async fn ssh_username(&self) -> anyhow::Result<String>;
    async fn state(&self) -> anyhow::Result<MachineState>;
    /// The Docker endpoint inside the machine.
    async fn url(&self) -> anyhow::Result<String>;
    /// The driver's state, persisted as `RawDriver` in the machine config.
    async fn config_raw(&self) -> anyhow::Result<serde_json::Value>;
    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()>;
}

/// A driver, dispatched statically for in-process drivers and over RPC
/// for plugins.
pub enum Driver {
    None(NoneDriver),
    Ssh(SshDriver),
    Kic(KicDriver),
    Plugin(PluginDriver),
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Driver({})", self.driver_name())
    }
}

impl Driver {
    /// A fresh driver for `name`. Out-of-tree drivers start their plugin.
    pub async fn new(name: &str, base: BaseDriver) -> anyhow::Result<Driver> {
        let def = lookup(name).ok_or_else(|| DriverError::NotFound(name.to_string()))?;
        Ok(match def.family {
            Family::BareMetal => Driver::None(NoneDriver::new(base)),
            Family::Ssh => Driver::Ssh(SshDriver::new(base)),
            Family::Kic => Driver::Kic(KicDriver::new(base, def.name)),
            Family::Vm => Driver::Plugin(PluginDriver::spawn(def.name).await?),
        })
    }

    /// Rehydrates a driver from its persisted raw blob.
    pub async fn load(name: &str, raw: serde_json::Value) -> anyhow::Result<Driver> {
        let mut d = Driver::new(name, BaseDriver::default()).await?;
        d.set_config_raw(raw).await?;
        Ok(d)
    }
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $e:expr) => {
        match $self {
            Driver::None($d) => $e,
            Driver::Ssh($d) => $e,
            Driver::Kic($d) => $e,
            Driver::Plugin($d) => $e,
        }
    };
}

#[async_trait::async_trait]
impl DriverCapability for Driver {
    fn driver_name(&self) -> String {
        dispatch!(self, d => d.driver_name())
    }
    async fn pre_create_check(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.pre_create_check().await)
    }
    async fn create(&mut self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()> {
        dispatch!(self, d => d.create(cc, node).await)
    }
    async fn start(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.start().await)
    }
    async fn stop(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.stop().await)
    }
    async fn restart(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.restart().await)
    }
    async fn remove(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.remove().await)
    }
    async fn kill(&mut self) -> anyhow::Result<()> {
        dispatch!(self, d => d.kill().await)
    }
    async fn ip(&self) -> anyhow::Result<String> {
        dispatch!(self, d => d.ip().await)
    }
    async fn ssh_hostname(&self) -> anyhow::Result<String> {
        dispatch!(self, d => d.ssh_hostname().await)
    }
    async fn ssh_port(&self) -> anyhow::Result<u16> {
        dispatch!(self, d => d.ssh_port().await)
    }
    async fn ssh_key_path(&self) -> anyhow::Result<String> {
        dispatch!(self, d => d.ssh_key_path().await)
    }
    async fn ssh_username(&self) -> anyhow::Result<String> {
        dispatch!(self, d => d.ssh_username().await)
    }
    async fn state(&self) -> anyhow::Result<MachineState> {
        dispatch!(self, d => d.state().await)
    }
    async fn url(&self) -> anyhow::Result<String> {
        dispatch!(self, d => d.url().await)
    }
    async fn config_raw(&self) -> anyhow::Result<serde_json::Value> {
        dispatch!(self, d => d.config_raw().await)
    }
    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()> {
        dispatch!(self, d => d.set_config_raw(raw).await)
    }
}
