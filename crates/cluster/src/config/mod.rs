//! Cluster configuration.
//!
//! A [`ClusterConfig`] is the persisted description of one profile. It is
//! stored as `<home>/profiles/<name>/config.json` by the [`Store`]. The
//! user-wide settings map lives in [`UserConfig`], and the values resolved
//! from the global command line flags travel as a [`Settings`].
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants;

mod profile;
mod settings;
pub mod user;

pub use profile::{Profile, ProfileList, Store};
pub(crate) use profile::{create_private_dir, to_json_indented, write_private};
pub use settings::Settings;
pub use user::UserConfig;

/// Words that cannot be used as profile names because they collide with
/// subcommands.
pub const RESERVED_KEYWORDS: [&str; 10] = [
    "start", "stop", "status", "delete", "config", "open", "profile", "addons", "cache", "logs",
];

/// Errors loading a profile.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The profile has no config file.
    #[error("cluster \"{0}\" does not exist")]
    NotFound(String),
    /// The config file exists but cannot be decoded.
    #[error("profile config {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unable to read profile config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durations are persisted as integer nanoseconds.
mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.as_nanos().min(i64::MAX as u128) as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let n = i64::deserialize(d)?;
        Ok(Duration::from_nanos(n.max(0) as u64))
    }
}

/// A `component.key=value` option passed to a Kubernetes component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtraOption {
    pub component: String,
    pub key: String,
    pub value: String,
}

impl std::fmt::Display for ExtraOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}={}", self.component, self.key, self.value)
    }
}

/// The Kubernetes half of a cluster's configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KubernetesConfig {
    pub kubernetes_version: String,
    pub cluster_name: String,
    pub namespace: String,
    #[serde(rename = "APIServerHAVIP", skip_serializing_if = "String::is_empty")]
    pub api_server_ha_vip: String,
    #[serde(rename = "APIServerName")]
    pub api_server_name: String,
    #[serde(rename = "APIServerNames")]
    pub api_server_names: Vec<String>,
    #[serde(rename = "APIServerIPs")]
    pub api_server_ips: Vec<String>,
    #[serde(rename = "DNSDomain")]
    pub dns_domain: String,
    pub container_runtime: String,
    #[serde(rename = "CRISocket")]
    pub cri_socket: String,
    pub network_plugin: String,
    pub feature_gates: String,
    #[serde(rename = "ServiceCIDR")]
    pub service_cidr: String,
    pub image_repository: String,
    #[serde(rename = "LoadBalancerStartIP")]
    pub load_balancer_start_ip: String,
    #[serde(rename = "LoadBalancerEndIP")]
    pub load_balancer_end_ip: String,
    pub custom_ingress_cert: String,
    pub registry_aliases: String,
    pub extra_options: Vec<ExtraOption>,
    pub should_load_cached_images: bool,
    #[serde(rename = "EnableDefaultCNI")]
    pub enable_default_cni: bool,
    #[serde(rename = "CNI")]
    pub cni: String,
    /// Legacy single-node fields, superseded by `ClusterConfig::nodes`.
    #[serde(rename = "NodeIP", skip_serializing_if = "String::is_empty")]
    pub node_ip: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub node_port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// One node of a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Node {
    pub name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub port: u16,
    pub kubernetes_version: String,
    pub container_runtime: String,
    pub control_plane: bool,
    pub worker: bool,
    #[serde(rename = "OS", skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "OSVersion", skip_serializing_if = "String::is_empty")]
    pub os_version: String,
}

/// The persisted configuration of one profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterConfig {
    pub name: String,
    pub keep_context: bool,
    pub embed_certs: bool,
    #[serde(rename = "MinikubeISO")]
    pub minikube_iso: String,
    pub kic_base_image: String,
    /// MiB.
    pub memory: u64,
    #[serde(rename = "CPUs")]
    pub cpus: u32,
    /// MiB.
    pub disk_size: u64,
    pub driver: String,
    #[serde(rename = "VMDriver", skip_serializing_if = "String::is_empty")]
    pub vm_driver: String,
    #[serde(rename = "HyperkitVpnKitSock")]
    pub hyperkit_vpnkit_sock: String,
    #[serde(rename = "HyperkitVSockPorts")]
    pub hyperkit_vsock_ports: Vec<String>,
    pub docker_env: Vec<String>,
    pub container_volume_mounts: Vec<String>,
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
    #[serde(rename = "HostOnlyCIDR")]
    pub host_only_cidr: String,
    pub hyperv_virtual_switch: String,
    #[serde(rename = "KVMNetwork")]
    pub kvm_network: String,
    #[serde(rename = "KVMQemuURI")]
    pub kvm_qemu_uri: String,
    #[serde(rename = "KVMGPU")]
    pub kvm_gpu: bool,
    #[serde(rename = "KVMHidden")]
    pub kvm_hidden: bool,
    pub docker_opt: Vec<String>,
    #[serde(rename = "NFSShare")]
    pub nfs_share: Vec<String>,
    #[serde(rename = "NFSSharesRoot")]
    pub nfs_shares_root: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub host_only_nic_type: String,
    pub nat_nic_type: String,
    #[serde(rename = "SSHIPAddress")]
    pub ssh_ip_address: String,
    #[serde(rename = "SSHUser")]
    pub ssh_user: String,
    #[serde(rename = "SSHKey")]
    pub ssh_key: String,
    #[serde(rename = "SSHPort")]
    pub ssh_port: u16,
    pub image_mirror_country: String,
    pub kubernetes_config: KubernetesConfig,
    pub nodes: Vec<Node>,
    pub addons: BTreeMap<String, bool>,
    pub verify_components: BTreeMap<String, bool>,
    #[serde(with = "nanos")]
    pub start_host_timeout: Duration,
    pub exposed_ports: Vec<String>,
    pub listen_address: String,
    pub network: String,
    #[serde(rename = "APIServerPort")]
    pub api_server_port: u16,
    pub disable_driver_mounts: bool,
    pub mount: bool,
    pub mount_string: String,
    #[serde(rename = "Mount9PVersion")]
    pub mount_9p_version: String,
    #[serde(rename = "MountGID")]
    pub mount_gid: String,
    #[serde(rename = "MountMSize")]
    pub mount_msize: u32,
    #[serde(rename = "MountUID")]
    pub mount_uid: String,
    #[serde(with = "nanos")]
    pub auto_pause_interval: Duration,
}

impl ClusterConfig {
    /// A config with the defaults every new profile starts from.
    pub fn new(name: &str) -> Self {
        ClusterConfig {
            name: name.to_string(),
            kic_base_image: constants::DEFAULT_KIC_BASE_IMAGE.to_string(),
            minikube_iso: constants::DEFAULT_ISO_URL.to_string(),
            cpus: 2,
            disk_size: 20000,
            api_server_port: constants::API_SERVER_PORT,
            start_host_timeout: constants::DEFAULT_START_HOST_TIMEOUT,
            mount_9p_version: "9p2000.L".to_string(),
            mount_gid: "docker".to_string(),
            mount_uid: "docker".to_string(),
            mount_msize: 262_144,
            kubernetes_config: KubernetesConfig {
                kubernetes_version: constants::DEFAULT_KUBERNETES_VERSION.to_string(),
                cluster_name: name.to_string(),
                namespace: "default".to_string(),
                api_server_name: constants::API_SERVER_NAME.to_string(),
                dns_domain: constants::CLUSTER_DNS_DOMAIN.to_string(),
                container_runtime: constants::DEFAULT_CONTAINER_RUNTIME.to_string(),
                service_cidr: constants::DEFAULT_SERVICE_CIDR.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Applies idempotent schema upgrades to a freshly decoded config.
    ///
    /// Only the in-memory value changes; callers persist it explicitly.
    pub fn upgrade(&mut self, profile: &str) {
        if self.driver.is_empty() && !self.vm_driver.is_empty() {
            debug!(driver = %self.vm_driver, "upgrading legacy VMDriver field");
            self.driver = std::mem::take(&mut self.vm_driver);
        }
        if self.name.is_empty() {
            self.name = profile.to_string();
        }
        if self.kic_base_image.is_empty() {
            self.kic_base_image = constants::DEFAULT_KIC_BASE_IMAGE.to_string();
        }
        if self.cpus == 0 {
            self.cpus = 2;
        }
        if self.memory == 0 {
            self.memory = suggest_memory_mib(host_memory_mib(), 0, self.nodes.len().max(1));
            info!(memory = self.memory, "recomputed missing memory allocation");
        }
        if self.api_server_port == 0 {
            self.api_server_port = self
                .nodes
                .iter()
                .find(|n| n.control_plane && n.port != 0)
                .map(|n| n.port)
                .or_else(|| Some(self.kubernetes_config.node_port).filter(|p| *p != 0))
                .unwrap_or(constants::API_SERVER_PORT);
        }
        if self.nodes.is_empty() && !self.kubernetes_config.kubernetes_version.is_empty() {
            self.nodes.push(legacy_control_plane(self));
            self.kubernetes_config.node_name.clear();
            self.kubernetes_config.node_ip.clear();
        }
    }

    /// The container runtime, falling back to the default.
    pub fn container_runtime(&self) -> &str {
        match self.kubernetes_config.container_runtime.as_str() {
            "" => constants::DEFAULT_CONTAINER_RUNTIME,
            rt => rt,
        }
    }

    /// Every control plane node, in registration order.
    pub fn control_planes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.control_plane)
    }

    /// Whether the cluster runs a highly available control plane: an odd
    /// number of control planes, at least three.
    pub fn is_ha(&self) -> bool {
        let n = self.control_planes().count();
        n >= 3 && n % 2 == 1
    }

    /// The primary control plane node.
    pub fn primary_control_plane(&self) -> anyhow::Result<Node> {
        if let Some(cp) = self.control_planes().next() {
            return Ok(cp.clone());
        }
        if self.nodes.is_empty() && !self.kubernetes_config.node_name.is_empty() {
            return Ok(legacy_control_plane(self));
        }
        anyhow::bail!("could not find control plane node in config")
    }

    /// Looks up a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// The next free node name, e.g. `m02` for a single node cluster.
    pub fn next_node_name(&self) -> String {
        let highest = self
            .nodes
            .iter()
            .filter_map(|n| n.name.strip_prefix('m').and_then(|s| s.parse::<usize>().ok()))
            .max()
            .unwrap_or(1)
            .max(self.nodes.len());
        format!("m{:02}", highest + 1)
    }

    /// Inserts or replaces `node` by name.
    pub fn save_node(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.name == node.name) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// The wait list stored in `VerifyComponents`, as component names.
    pub fn wait_components(&self) -> Vec<String> {
        self.verify_components
            .iter()
            .filter(|(_, v)| **v)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether an addon is recorded as enabled.
    pub fn addon_enabled(&self, name: &str) -> bool {
        self.addons.get(name).copied().unwrap_or(false)
    }
}

fn legacy_control_plane(cc: &ClusterConfig) -> Node {
    let kc = &cc.kubernetes_config;
    Node {
        name: if kc.node_name.is_empty() {
            cc.name.clone()
        } else {
            kc.node_name.clone()
        },
        ip: kc.node_ip.clone(),
        port: if kc.node_port == 0 {
            constants::API_SERVER_PORT
        } else {
            kc.node_port
        },
        kubernetes_version: kc.kubernetes_version.clone(),
        container_runtime: kc.container_runtime.clone(),
        control_plane: true,
        worker: true,
        ..Default::default()
    }
}

/// The machine name used by the driver for `node`.
pub fn machine_name(cc: &ClusterConfig, node: &Node) -> String {
    if (cc.nodes.len() == 1 && cc.nodes[0].name == node.name) || node.control_plane && is_primary(cc, node) {
        return cc.name.clone();
    }
    format!("{}-{}", cc.name, node.name)
}

fn is_primary(cc: &ClusterConfig, node: &Node) -> bool {
    cc.control_planes()
        .next()
        .map_or(true, |cp| cp.name == node.name)
}

lazy_static! {
    static ref PROFILE_NAME: Regex = Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$"
    )
    .expect("profile name pattern compiles");
}

/// Whether `name` is syntactically usable as a profile name.
pub fn profile_name_valid(name: &str) -> bool {
    name.len() > 1 && PROFILE_NAME.is_match(name)
}

/// Whether `name` collides with a subcommand.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_KEYWORDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(name))
}

/// Checks a profile name, failing with a classified usage error.
pub fn validate_profile_name(name: &str) -> anyhow::Result<()> {
    if is_reserved(name) {
        return Err(crate::reason::with_kind(
            crate::reason::INTERNAL_RESERVED_PROFILE,
            anyhow::anyhow!("profile name \"{}\" is reserved keyword. To delete this profile, run: \"minikube delete -p {}\"", name, name),
        ));
    }
    if !profile_name_valid(name) {
        return Err(crate::reason::usage(format!(
            "profile name \"{}\" is not valid: must be at least two characters and match [a-zA-Z0-9][a-zA-Z0-9.-]*",
            name
        )));
    }
    Ok(())
}

/// Suggests a memory allocation in MiB from the host and container limits.
pub fn suggest_memory_mib(sys_mib: u64, container_mib: u64, nodes: usize) -> u64 {
    const FALLBACK: u64 = 2200;
    let mut maximum = 6000;
    if sys_mib > 0 && FALLBACK > sys_mib {
        return sys_mib;
    }
    if container_mib > 0 {
        if FALLBACK > container_mib {
            return container_mib;
        }
        maximum = container_mib.saturating_sub(48);
    }
    // A quarter of the host, in 100 MiB steps.
    let mut suggested = sys_mib / 400 * 100;
    if nodes > 1 {
        suggested /= nodes as u64;
    }
    suggested.clamp(FALLBACK, maximum.max(FALLBACK))
}

/// Total host memory in MiB, or 0 when it cannot be determined.
pub fn host_memory_mib() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo_total(&s))
        .unwrap_or(0)
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Parses sizes such as `4g`, `2048mb` or `20000` (MiB) into MiB.
pub fn parse_size_mib(s: &str) -> anyhow::Result<u64> {
    let lower = s.trim().to_ascii_lowercase();
    let digits_end = lower
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(lower.len());
    let (num, unit) = lower.split_at(digits_end);
    let value: f64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid size {:?}", s))?;
    let factor = match unit.trim() {
        "" | "m" | "mb" | "mi" | "mib" => 1.0,
        "k" | "kb" | "ki" | "kib" => 1.0 / 1024.0,
        "g" | "gb" | "gi" | "gib" => 1024.0,
        "t" | "tb" | "ti" | "tib" => 1024.0 * 1024.0,
        "b" => 1.0 / (1024.0 * 1024.0),
        other => anyhow::bail!("invalid size unit {:?} in {:?}", other, s),
    };
    Ok((value * factor) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn two_node() -> ClusterConfig {
        let mut cc = ClusterConfig::new("p1");
        cc.nodes = vec![
            Node {
                name: "".to_string(),
                control_plane: true,
                worker: true,
                ..Default::default()
            },
            Node {
                name: "m02".to_string(),
                worker: true,
                ..Default::default()
            },
        ];
        cc
    }

    #[test]
    fn machine_names() {
        let cc = two_node();
        assert_eq!(machine_name(&cc, &cc.nodes[0]), "p1");
        assert_eq!(machine_name(&cc, &cc.nodes[1]), "p1-m02");

        let mut single = ClusterConfig::new("solo");
        single.nodes.push(Node {
            name: "solo".to_string(),
            ..Default::default()
        });
        assert_eq!(machine_name(&single, &single.nodes[0]), "solo");
    }

    #[test]
    fn profile_names() {
        for ok in &["minikube", "p1", "a.b-c", "Cluster-2"] {
            assert!(profile_name_valid(ok), "{} should be valid", ok);
        }
        for bad in &["a", "", "-x", "x-", "has space", "under_score"] {
            assert!(!profile_name_valid(bad), "{} should be invalid", bad);
        }
        assert!(is_reserved("Start"));
        assert!(validate_profile_name("logs").is_err());
        assert!(validate_profile_name("dev").is_ok());
    }

    #[test]
    fn legacy_upgrade() {
        let raw = r#"{
            "Name": "",
            "VMDriver": "kvm2",
            "Memory": 4000,
            "KubernetesConfig": {
                "KubernetesVersion": "v1.20.0",
                "NodeIP": "192.168.39.2",
                "NodePort": 8444,
                "NodeName": "minikube"
            }
        }"#;
        let mut cc: ClusterConfig = serde_json::from_str(raw).expect("decode");
        cc.upgrade("minikube");
        assert_eq!(cc.driver, "kvm2");
        assert!(cc.vm_driver.is_empty());
        assert_eq!(cc.name, "minikube");
        assert_eq!(cc.kic_base_image, constants::DEFAULT_KIC_BASE_IMAGE);
        assert_eq!(cc.cpus, 2);
        assert_eq!(cc.api_server_port, 8444);
        let cp = cc.primary_control_plane().expect("control plane");
        assert_eq!(cp.ip, "192.168.39.2");
        assert_eq!(cp.port, 8444);

        let once = cc.clone();
        cc.upgrade("minikube");
        assert_eq!(cc, once, "upgrade is idempotent");
    }

    #[test]
    fn field_names_are_stable() {
        let mut cc = ClusterConfig::new("p");
        cc.start_host_timeout = Duration::from_secs(1);
        let v = serde_json::to_value(&cc).expect("encode");
        assert_eq!(v["CPUs"], 2);
        assert_eq!(v["APIServerPort"], 8443);
        assert_eq!(v["StartHostTimeout"], 1_000_000_000i64);
        assert_eq!(v["KubernetesConfig"]["ServiceCIDR"], "10.96.0.0/12");
        assert!(v.get("VMDriver").is_none());
    }

    #[test]
    fn node_bookkeeping() {
        let mut cc = two_node();
        assert_eq!(cc.next_node_name(), "m03");
        let mut updated = cc.nodes[1].clone();
        updated.ip = "10.0.0.3".to_string();
        cc.save_node(updated);
        assert_eq!(cc.nodes.len(), 2);
        assert_eq!(cc.nodes[1].ip, "10.0.0.3");
        cc.save_node(Node {
            name: "m03".to_string(),
            ..Default::default()
        });
        assert_eq!(cc.nodes.len(), 3);
        assert!(!cc.is_ha());
    }

    #[test]
    fn ha_needs_an_odd_quorum_of_control_planes() {
        let mut cc = ClusterConfig::new("ha");
        let mut counts = Vec::new();
        for i in 1..=5 {
            cc.nodes.push(Node {
                name: if i == 1 { String::new() } else { format!("m{:02}", i) },
                control_plane: true,
                worker: true,
                ..Default::default()
            });
            counts.push((i, cc.is_ha()));
        }
        assert_eq!(counts, vec![(1, false), (2, false), (3, true), (4, false), (5, true)]);
    }

    #[test]
    fn memory_suggestions() {
        assert_eq!(suggest_memory_mib(1024, 0, 1), 1024);
        assert_eq!(suggest_memory_mib(8192, 0, 1), 2200);
        assert_eq!(suggest_memory_mib(16384, 0, 1), 4000);
        assert_eq!(suggest_memory_mib(65536, 0, 1), 6000);
        assert_eq!(suggest_memory_mib(65536, 4096, 1), 4048);
        assert_eq!(suggest_memory_mib(32768, 0, 2), 4050);
    }

    #[test]
    fn meminfo() {
        let s = "MemTotal:       16318352 kB\nMemFree:  1 kB\n";
        assert_eq!(parse_meminfo_total(s), Some(15935));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size_mib("20000").expect("plain"), 20000);
        assert_eq!(parse_size_mib("4g").expect("g"), 4096);
        assert_eq!(parse_size_mib("2048mb").expect("mb"), 2048);
        assert!(parse_size_mib("lots").is_err());
        assert!(parse_size_mib("4x").is_err());
    }
}
