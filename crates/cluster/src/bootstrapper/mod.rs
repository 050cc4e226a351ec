//! Installing and verifying Kubernetes on a prepared node.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Runner;
use crate::config::{ClusterConfig, Node};
use crate::constants;
use crate::cruntime::Manager;
use crate::localpath::MiniHome;
use crate::reason;

pub mod extra;
pub mod kubeadm;
pub mod verify;
pub mod versions;

pub use kubeadm::Kubeadm;

/// Installs Kubernetes on the nodes of a cluster.
#[async_trait::async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Copies binaries, the kubelet units and (for the primary control
    /// plane) the kubeadm config into the node.
    async fn update_node(&self, cc: &ClusterConfig, node: &Node, runtime: &dyn Manager) -> anyhow::Result<()>;

    async fn setup_certs(&self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()>;

    /// Whether the node already holds an initialized control plane.
    async fn existing_config(&self) -> bool;

    /// Initializes a new control plane.
    async fn bootstrap(&self, cc: &ClusterConfig) -> anyhow::Result<()>;

    /// Brings an existing control plane back up, reconfiguring it when the
    /// rendered config changed.
    async fn restart(&self, cc: &ClusterConfig) -> anyhow::Result<()>;

    /// Bootstraps or restarts, depending on what the node holds.
    async fn start_cluster(&self, cc: &ClusterConfig) -> anyhow::Result<()> {
        if self.existing_config().await {
            self.restart(cc).await
        } else {
            self.bootstrap(cc).await
        }
    }

    async fn join_command(&self, cc: &ClusterConfig) -> anyhow::Result<String>;

    async fn join(&self, cc: &ClusterConfig, node: &Node, join_cmd: &str, runtime: &dyn Manager) -> anyhow::Result<()>;

    /// Waits for the components named by the cluster's wait policy.
    async fn verify(&self, cc: &ClusterConfig, node: &Node, host: &str, port: u16, timeout: Duration) -> anyhow::Result<()>;

    /// Writes the profile's context into the kubeconfig at `path`.
    async fn update_kubeconfig(&self, cc: &ClusterConfig, path: &Path, host: &str, port: u16) -> anyhow::Result<()>;

    async fn delete_cluster(&self, cc: &ClusterConfig, runtime: &dyn Manager) -> anyhow::Result<()>;

    fn runner(&self) -> &Arc<dyn Runner>;
}

/// The bootstrapper named `name` for the node behind `runner`.
pub fn new_bootstrapper(name: &str, home: MiniHome, runner: Arc<dyn Runner>) -> anyhow::Result<Box<dyn Bootstrapper>> {
    match name {
        "" | constants::DEFAULT_BOOTSTRAPPER => Ok(Box::new(Kubeadm::new(home, runner))),
        other => Err(reason::with_kind(
            reason::INTERNAL_BOOTSTRAPPER,
            anyhow::anyhow!("unknown bootstrapper: {}", other),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn only_kubeadm_is_known() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        assert!(new_bootstrapper("kubeadm", home.clone(), Arc::new(FakeRunner::default())).is_ok());
        assert!(new_bootstrapper("localkube", home, Arc::new(FakeRunner::default())).is_err());
    }

    #[tokio::test]
    async fn existing_control_planes_are_restarted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeRunner::default().respond("ls /var/lib/kubelet", "", 2));
        let b = Kubeadm::new(MiniHome::new(dir.path()), runner.clone());
        assert!(!b.existing_config().await);
        let runner = Arc::new(FakeRunner::default());
        let b = Kubeadm::new(MiniHome::new(dir.path()), runner);
        assert!(b.existing_config().await);
    }
}
