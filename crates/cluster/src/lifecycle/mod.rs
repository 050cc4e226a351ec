//! Driving clusters through their lifecycle.
//!
//! Every command that touches a running cluster starts from a
//! [`ClusterController`]: the profile's config plus a handle on its primary
//! control plane. Commands that must also cope with stopped or half-deleted
//! clusters load the pieces they need themselves.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use machine_rpc::MachineState;
use tracing::debug;

use crate::command::Runner;
use crate::config::{machine_name, ClusterConfig, ConfigError, Node, Settings, Store};
use crate::cruntime::{self, Manager, RuntimeKind};
use crate::driver::{self, kic, Driver, DriverCapability};
use crate::localpath::MiniHome;
use crate::machine::{self, Host, MachineStore};
use crate::reason;

pub mod access;
pub mod addons;
pub mod connect;
pub mod delete;
pub mod images;
pub mod node;
pub mod pause;
pub mod profiles;
pub mod start;
pub mod status;
pub mod stop;

pub use delete::{DeletionError, DeletionKind};
pub use start::StartOptions;
pub use status::NodeStatus;

/// How long a command waits for another invocation holding the profile.
pub const PROFILE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Loads the config of `name`, classifying a missing profile.
pub async fn load_config(store: &Store, name: &str) -> anyhow::Result<ClusterConfig> {
    match store.load(name).await {
        Ok(cc) => Ok(cc),
        Err(e @ ConfigError::NotFound(_)) => Err(reason::with_kind(
            reason::GUEST_NOT_FOUND,
            anyhow::anyhow!("Profile \"{}\" not found: {}", name, e),
        )),
        Err(e) => Err(reason::with_kind(reason::HOST_CONFIG_LOAD, e)),
    }
}

/// The apiserver endpoint of `node` as reachable from this host.
///
/// Container nodes behind a VM or a remote daemon are reached through the
/// port published on the daemon's host.
pub async fn api_endpoint(cc: &ClusterConfig, node: &Node, driver: &Driver) -> anyhow::Result<(String, u16)> {
    let port = if node.port == 0 { cc.api_server_port } else { node.port };
    if driver::needs_port_forward(&cc.driver) {
        let host = kic::daemon_host(&cc.driver).unwrap_or_else(|| "127.0.0.1".to_string());
        let mapped = kic::mapped_port(&cc.driver, &machine_name(cc, node), port)
            .await
            .map_err(|e| reason::with_kind(reason::DRV_CP_ENDPOINT, e))?;
        return Ok((host, mapped));
    }
    let ip = driver
        .ip()
        .await
        .map_err(|e| reason::with_kind(reason::DRV_CP_ENDPOINT, e))?;
    Ok((ip, port))
}

/// A machine with a way to run commands on it.
pub struct NodeHandle {
    pub node: Node,
    pub machine_name: String,
    pub host: Host,
    pub driver: Driver,
    pub runner: Arc<dyn Runner>,
}

impl NodeHandle {
    /// Loads the machine behind `node` without checking its state.
    pub async fn load(home: &MiniHome, cc: &ClusterConfig, node: &Node) -> anyhow::Result<Self> {
        let name = machine_name(cc, node);
        let host = MachineStore::new(home.clone())
            .load(&name)
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_LOAD_HOST, e))?;
        let driver = host.driver().await?;
        let runner = machine::command_runner(&driver, &name).await?;
        Ok(NodeHandle {
            node: node.clone(),
            machine_name: name,
            host,
            driver,
            runner,
        })
    }

    pub async fn state(&self) -> anyhow::Result<MachineState> {
        self.driver
            .state()
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_STATUS, e))
    }

    /// The container runtime of the node.
    pub fn runtime(&self, cc: &ClusterConfig) -> anyhow::Result<Box<dyn Manager>> {
        runtime_for(cc, &self.node, self.runner.clone())
    }
}

/// A runtime manager for `node` over `runner`.
pub fn runtime_for(cc: &ClusterConfig, node: &Node, runner: Arc<dyn Runner>) -> anyhow::Result<Box<dyn Manager>> {
    let name = if node.container_runtime.is_empty() {
        cc.container_runtime()
    } else {
        node.container_runtime.as_str()
    };
    let kind = RuntimeKind::from_name(name).ok_or_else(|| {
        reason::with_kind(
            reason::INTERNAL_NEW_RUNTIME,
            anyhow::anyhow!("unknown container runtime {:?}", name),
        )
    })?;
    let version = if node.kubernetes_version.is_empty() {
        &cc.kubernetes_config.kubernetes_version
    } else {
        &node.kubernetes_version
    };
    Ok(cruntime::new_runtime(kind, runner, version))
}

/// The primary control plane of a running cluster.
pub struct ControlPlane {
    pub handle: NodeHandle,
    /// Apiserver host and port as reachable from this host.
    pub hostname: String,
    pub port: u16,
    /// The node's own address.
    pub ip: String,
}

/// A running cluster.
pub struct ClusterController {
    pub config: ClusterConfig,
    pub cp: ControlPlane,
}

impl ClusterController {
    /// Loads the active profile. Fails with `GUEST_NOT_RUNNING` unless its
    /// control plane machine is running.
    pub async fn load(settings: &Settings) -> anyhow::Result<Self> {
        let cc = load_config(&settings.store(), &settings.profile).await?;
        Self::from_config(&settings.home, cc).await
    }

    pub async fn from_config(home: &MiniHome, cc: ClusterConfig) -> anyhow::Result<Self> {
        let node = cc
            .primary_control_plane()
            .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e))?;
        let handle = NodeHandle::load(home, &cc, &node).await?;
        let state = handle.state().await?;
        if state != MachineState::Running {
            return Err(reason::with_kind(
                reason::GUEST_NOT_RUNNING,
                anyhow::anyhow!(
                    "The control plane node \"{}\" must be running for this command (state: {})",
                    handle.machine_name,
                    state
                ),
            ));
        }
        let ip = handle
            .driver
            .ip()
            .await
            .context("getting control plane IP")?;
        let (hostname, port) = api_endpoint(&cc, &node, &handle.driver).await?;
        debug!(profile = %cc.name, %hostname, port, "loaded control plane");
        Ok(ClusterController {
            config: cc,
            cp: ControlPlane {
                handle,
                hostname,
                port,
                ip,
            },
        })
    }

    pub fn profile(&self) -> &str {
        &self.config.name
    }

    /// The node named `name`, or the primary control plane for an empty name.
    pub fn node(&self, name: &str) -> anyhow::Result<Node> {
        find_node(&self.config, name)
    }
}

/// Looks up a node by its name or by its machine name. An empty name
/// selects the primary control plane.
pub fn find_node(cc: &ClusterConfig, name: &str) -> anyhow::Result<Node> {
    if name.is_empty() {
        return cc
            .primary_control_plane()
            .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e));
    }
    cc.nodes
        .iter()
        .find(|n| n.name == name || machine_name(cc, n) == name)
        .cloned()
        .ok_or_else(|| {
            reason::with_kind(
                reason::GUEST_NODE_RETRIEVE,
                anyhow::anyhow!("retrieving node: Could not find node {}", name),
            )
        })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::constants;

    /// A valid profile with `workers` extra worker nodes.
    pub(crate) fn cluster(name: &str, driver: &str, workers: usize) -> ClusterConfig {
        let mut cc = ClusterConfig::new(name);
        cc.driver = driver.to_string();
        cc.memory = 2200;
        cc.nodes.push(Node {
            name: String::new(),
            ip: "192.168.49.2".to_string(),
            port: constants::API_SERVER_PORT,
            kubernetes_version: constants::DEFAULT_KUBERNETES_VERSION.to_string(),
            control_plane: true,
            worker: true,
            ..Default::default()
        });
        for i in 0..workers {
            cc.nodes.push(Node {
                name: format!("m{:02}", i + 2),
                ip: format!("192.168.49.{}", i + 3),
                kubernetes_version: constants::DEFAULT_KUBERNETES_VERSION.to_string(),
                worker: true,
                ..Default::default()
            });
        }
        cc
    }

    #[tokio::test]
    async fn missing_profiles_are_guest_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(MiniHome::new(dir.path()));
        let err = load_config(&store, "ghost").await.expect_err("missing");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("GUEST_NOT_FOUND"));
        assert!(format!("{:#}", err).contains("ghost"));
    }

    #[test]
    fn nodes_are_found_by_node_or_machine_name() {
        let cc = cluster("p1", "docker", 2);
        assert!(find_node(&cc, "").expect("primary").control_plane);
        assert_eq!(find_node(&cc, "m02").expect("m02").ip, "192.168.49.3");
        assert_eq!(find_node(&cc, "p1-m03").expect("m03").name, "m03");
        let err = find_node(&cc, "m09").expect_err("missing");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("GUEST_NODE_RETRIEVE"));
    }

    #[test]
    fn runtimes_follow_the_node_then_the_cluster() {
        let mut cc = cluster("p1", "docker", 1);
        cc.kubernetes_config.container_runtime = "containerd".to_string();
        let runner: Arc<dyn Runner> = Arc::new(crate::command::fake::FakeRunner::default());
        let rt = runtime_for(&cc, &cc.nodes[0], runner.clone()).expect("runtime");
        assert_eq!(rt.kind(), RuntimeKind::Containerd);
        let mut node = cc.nodes[1].clone();
        node.container_runtime = "crio".to_string();
        assert_eq!(runtime_for(&cc, &node, runner.clone()).expect("runtime").kind(), RuntimeKind::Crio);
        node.container_runtime = "rkt".to_string();
        assert!(runtime_for(&cc, &node, runner).is_err());
    }
}
