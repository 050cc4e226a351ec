//! Container runtimes inside the guest.
//!
//! A [`Manager`] drives one runtime (docker, containerd or CRI-O) through a
//! [`Runner`] attached to the node.
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::command::{Cmd, Runner};
use crate::constants;
use crate::driver;
use crate::reason;

mod containerd;
mod cri;
mod crio;
mod docker;

pub use containerd::Containerd;
pub use crio::Crio;
pub use docker::Docker;

/// The runtimes minikube can install.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Crio,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [RuntimeKind::Docker, RuntimeKind::Containerd, RuntimeKind::Crio];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | constants::DOCKER => Some(RuntimeKind::Docker),
            constants::CONTAINERD => Some(RuntimeKind::Containerd),
            constants::CRIO | "cri-o" => Some(RuntimeKind::Crio),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeKind::Docker => constants::DOCKER,
            RuntimeKind::Containerd => constants::CONTAINERD,
            RuntimeKind::Crio => constants::CRIO,
        }
    }

    /// The systemd unit running the runtime.
    pub fn service(self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::Crio => "crio",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime settings taken from the cluster config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
    pub docker_env: Vec<String>,
    pub docker_opt: Vec<String>,
    pub cgroup_driver: String,
    /// Registry the pause image is pulled from; empty for the default.
    pub image_repository: String,
    pub kubernetes_version: String,
}

impl RuntimeOptions {
    pub fn from_config(cc: &crate::config::ClusterConfig) -> Self {
        RuntimeOptions {
            insecure_registry: cc.insecure_registry.clone(),
            registry_mirror: cc.registry_mirror.clone(),
            docker_env: cc.docker_env.clone(),
            docker_opt: cc.docker_opt.clone(),
            cgroup_driver: constants::SYSTEMD_CGROUP_DRIVER.to_string(),
            image_repository: cc.kubernetes_config.image_repository.clone(),
            kubernetes_version: cc.kubernetes_config.kubernetes_version.clone(),
        }
    }

    fn cgroup_driver(&self) -> &str {
        if self.cgroup_driver.is_empty() {
            constants::SYSTEMD_CGROUP_DRIVER
        } else {
            &self.cgroup_driver
        }
    }

    /// The pause image matching the Kubernetes version.
    pub fn pause_image(&self) -> String {
        let repo = if self.image_repository.is_empty() {
            "registry.k8s.io"
        } else {
            self.image_repository.trim_end_matches('/')
        };
        format!("{}/pause:{}", repo, pause_version(&self.kubernetes_version))
    }
}

fn pause_version(k8s: &str) -> &'static str {
    let minor = semver::Version::parse(k8s.trim_start_matches('v'))
        .map(|v| v.minor)
        .unwrap_or(u64::MAX);
    match minor {
        0..=18 => "3.2",
        19..=20 => "3.4.1",
        21..=22 => "3.5",
        23..=24 => "3.7",
        25..=26 => "3.9",
        _ => "3.10",
    }
}

/// Which containers to list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    All,
    Running,
    Paused,
}

/// Operations on a container runtime in the guest.
#[async_trait::async_trait]
pub trait Manager: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// The CRI endpoint kubelet talks to.
    fn socket_path(&self) -> String;

    async fn version(&self) -> anyhow::Result<String>;

    async fn active(&self) -> bool {
        self.runner()
            .run(Cmd::sudo("systemctl").args(["is-active", "--quiet", "service", self.kind().service()]))
            .await
            .is_ok()
    }

    /// Writes the runtime configuration and (re)starts the runtime.
    async fn enable(&self, opts: &RuntimeOptions) -> anyhow::Result<()>;

    async fn disable(&self) -> anyhow::Result<()> {
        self.runner()
            .run(Cmd::sudo("systemctl").args(["stop", "-f", self.kind().service()]))
            .await?;
        Ok(())
    }

    /// IDs of containers in `state` belonging to pods in `namespaces`. An
    /// empty namespace list means every namespace.
    async fn list_containers(&self, state: ContainerState, namespaces: &[String]) -> anyhow::Result<Vec<String>>;
    async fn pause_containers(&self, ids: &[String]) -> anyhow::Result<()>;
    async fn unpause_containers(&self, ids: &[String]) -> anyhow::Result<()>;
    async fn stop_containers(&self, ids: &[String]) -> anyhow::Result<()>;
    async fn kill_containers(&self, ids: &[String]) -> anyhow::Result<()>;

    /// Loads an image tarball already present on the node.
    async fn load_image(&self, path: &str) -> anyhow::Result<()>;
    async fn remove_image(&self, name: &str) -> anyhow::Result<()>;
    async fn list_images(&self) -> anyhow::Result<Vec<String>>;

    /// Extracts a preloaded image tarball already present on the node into
    /// the runtime's image store.
    async fn preload(&self, tarball: &str) -> anyhow::Result<()> {
        let runner = self.runner();
        runner
            .run(Cmd::sudo("tar").args([
                "--xattrs",
                "--xattrs-include",
                "security.capability",
                "-I",
                "lz4",
                "-C",
                "/var",
                "-xf",
                tarball,
            ]))
            .await?;
        runner.run(Cmd::sudo("rm").args(["-f", tarball])).await?;
        Ok(())
    }

    fn runner(&self) -> &Arc<dyn Runner>;
}

/// A manager for `kind` on the node behind `runner`.
pub fn new_runtime(kind: RuntimeKind, runner: Arc<dyn Runner>, kubernetes_version: &str) -> Box<dyn Manager> {
    match kind {
        RuntimeKind::Docker => Box::new(Docker::new(runner, kubernetes_version)),
        RuntimeKind::Containerd => Box::new(Containerd::new(runner)),
        RuntimeKind::Crio => Box::new(Crio::new(runner)),
    }
}

/// Enables `kind` and stops every other runtime that is running.
pub async fn enable_runtime(kind: RuntimeKind, runner: Arc<dyn Runner>, opts: &RuntimeOptions) -> anyhow::Result<Box<dyn Manager>> {
    for other in RuntimeKind::ALL.iter().copied().filter(|k| *k != kind) {
        // Docker stays up underneath containerd, which it uses itself.
        if kind == RuntimeKind::Containerd && other == RuntimeKind::Docker {
            continue;
        }
        let m = new_runtime(other, runner.clone(), &opts.kubernetes_version);
        if m.active().await {
            if let Err(e) = m.disable().await {
                warn!(runtime = %other, error = %e, "unable to stop runtime");
            }
        }
    }
    let manager = new_runtime(kind, runner, &opts.kubernetes_version);
    manager
        .enable(opts)
        .await
        .map_err(|e| reason::with_kind(reason::RUNTIME_ENABLE, e))?;
    info!(runtime = %kind, "container runtime enabled");
    Ok(manager)
}

/// Writes `/etc/crictl.yaml` pointing crictl at `socket`.
pub(crate) async fn write_crictl_config(runner: &dyn Runner, socket: &str) -> anyhow::Result<()> {
    runner
        .copy(&crate::command::Asset::memory(
            format!("runtime-endpoint: {}\n", socket).into_bytes(),
            "/etc",
            "crictl.yaml",
            "0644",
        ))
        .await
}

/// Which environment redirection command is being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvCommand {
    DockerEnv,
    PodmanEnv,
}

/// Checks that `docker-env` or `podman-env` can target a cluster.
pub fn check_env_compatible(command: EnvCommand, driver_name: &str, runtime: &str, nodes: usize) -> anyhow::Result<()> {
    let cmd = match command {
        EnvCommand::DockerEnv => "docker-env",
        EnvCommand::PodmanEnv => "podman-env",
    };
    if driver::bare_metal(driver_name) {
        return Err(reason::with_kind(
            reason::ENV_DRIVER_CONFLICT,
            anyhow::anyhow!("The {} command is incompatible with the none driver", cmd),
        ));
    }
    if nodes > 1 {
        return Err(reason::with_kind(
            reason::ENV_MULTINODE_CONFLICT,
            anyhow::anyhow!("The {} command is incompatible with multi-node clusters. Use the 'registry' addon instead", cmd),
        ));
    }
    let kind = RuntimeKind::from_name(runtime).ok_or_else(|| reason::usage(format!("unknown container runtime {:?}", runtime)))?;
    let ok = match (command, kind) {
        (EnvCommand::DockerEnv, RuntimeKind::Docker) => true,
        (EnvCommand::DockerEnv, RuntimeKind::Containerd) => driver_name == driver::DOCKER,
        (EnvCommand::DockerEnv, RuntimeKind::Crio) => false,
        (EnvCommand::PodmanEnv, RuntimeKind::Crio) => true,
        (EnvCommand::PodmanEnv, _) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(reason::with_kind(
            reason::ENV_DRIVER_CONFLICT,
            anyhow::anyhow!(
                "The {} command is incompatible with the {} runtime on the {} driver",
                cmd,
                kind,
                driver_name
            ),
        ))
    }
}
