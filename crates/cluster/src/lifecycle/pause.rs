//! `minikube pause` and `minikube unpause`.
use tracing::{debug, info};

use crate::command::{Cmd, Runner};
use crate::config::{machine_name, Settings};
use crate::constants;
use crate::cruntime::{ContainerState, Manager};
use crate::out::Icon;
use crate::reason;

use super::{load_config, NodeHandle};

/// The namespaces to act on: every namespace for `all`, the given ones, or
/// the Kubernetes system namespaces by default.
pub fn namespaces(all: bool, requested: &[String]) -> Vec<String> {
    if all {
        return Vec::new();
    }
    if requested.is_empty() {
        return constants::DEFAULT_NAMESPACES.iter().map(|s| s.to_string()).collect();
    }
    requested.to_vec()
}

/// Stops kubelet and pauses the running containers of `namespaces`.
/// Returns the paused container IDs.
pub async fn pause_node(runner: &dyn Runner, runtime: &dyn Manager, namespaces: &[String]) -> anyhow::Result<Vec<String>> {
    runner
        .run(Cmd::sudo("systemctl").args(["disable", "--now", "kubelet"]))
        .await?;
    let ids = runtime.list_containers(ContainerState::Running, namespaces).await?;
    if ids.is_empty() {
        debug!("no running containers to pause");
        return Ok(ids);
    }
    runtime.pause_containers(&ids).await?;
    Ok(ids)
}

/// Unpauses the paused containers of `namespaces` and starts kubelet again.
/// Returns the unpaused container IDs.
pub async fn unpause_node(runner: &dyn Runner, runtime: &dyn Manager, namespaces: &[String]) -> anyhow::Result<Vec<String>> {
    let ids = runtime.list_containers(ContainerState::Paused, namespaces).await?;
    if !ids.is_empty() {
        runtime.unpause_containers(&ids).await?;
    }
    runner
        .run(Cmd::sudo("systemctl").args(["enable", "--now", "kubelet"]))
        .await?;
    Ok(ids)
}

/// Pauses (or unpauses) every node of the profile in registration order.
pub async fn run(settings: &Settings, pause: bool, all_namespaces: bool, requested: &[String]) -> anyhow::Result<Vec<String>> {
    let out = settings.out();
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let namespaces = namespaces(all_namespaces, requested);
    let kind = if pause { reason::GUEST_PAUSE } else { reason::GUEST_UNPAUSE };
    let mut ids = Vec::new();
    for node in &cc.nodes {
        let machine = machine_name(&cc, node);
        if pause {
            out.step(Icon::Pause, format!("Pausing node {} ... ", machine));
        } else {
            out.step(Icon::Unpause, format!("Unpausing node {} ... ", machine));
        }
        let handle = NodeHandle::load(&settings.home, &cc, node).await?;
        let runtime = handle.runtime(&cc)?;
        let res = if pause {
            pause_node(handle.runner.as_ref(), runtime.as_ref(), &namespaces).await
        } else {
            unpause_node(handle.runner.as_ref(), runtime.as_ref(), &namespaces).await
        };
        let node_ids = res.map_err(|e| reason::with_kind(kind.clone(), e))?;
        info!(%machine, count = node_ids.len(), pause, "containers updated");
        ids.extend(node_ids);
    }
    let scope = if namespaces.is_empty() {
        "all namespaces".to_string()
    } else {
        namespaces.join(", ")
    };
    if pause {
        out.step(Icon::Pause, format!("Paused {} containers in: {}", ids.len(), scope));
    } else {
        out.step(Icon::Unpause, format!("Unpaused {} containers in: {}", ids.len(), scope));
    }
    Ok(ids)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::command::fake::FakeRunner;
    use crate::cruntime::{new_runtime, RuntimeKind};

    #[test]
    fn namespaces_default_to_the_system_ones() {
        assert!(namespaces(true, &["default".to_string()]).is_empty());
        assert_eq!(namespaces(false, &["apps".to_string()]), vec!["apps"]);
        assert_eq!(namespaces(false, &[]).len(), constants::DEFAULT_NAMESPACES.len());
    }

    #[tokio::test]
    async fn pausing_stops_kubelet_first() {
        let runner = Arc::new(FakeRunner::default().respond("docker ps", "abc\ndef\n", 0));
        let docker = new_runtime(RuntimeKind::Docker, runner.clone(), constants::DEFAULT_KUBERNETES_VERSION);
        let ids = pause_node(runner.as_ref(), docker.as_ref(), &["kube-system".to_string()])
            .await
            .expect("pause");
        assert_eq!(ids, vec!["abc", "def"]);
        let seen = runner.commands();
        assert!(seen[0].contains("systemctl disable --now kubelet"));
        assert!(seen[1].contains("--filter=status=running"));
        assert!(seen[2].contains("docker pause abc def"));
    }

    #[tokio::test]
    async fn unpausing_restarts_kubelet_last() {
        let runner = Arc::new(FakeRunner::default().respond("docker ps", "abc\n", 0));
        let docker = new_runtime(RuntimeKind::Docker, runner.clone(), constants::DEFAULT_KUBERNETES_VERSION);
        let ids = unpause_node(runner.as_ref(), docker.as_ref(), &[]).await.expect("unpause");
        assert_eq!(ids, vec!["abc"]);
        let seen = runner.commands();
        assert!(seen[0].contains("--filter=status=paused"));
        assert!(seen[1].contains("docker unpause abc"));
        assert!(seen.last().expect("last").contains("systemctl enable --now kubelet"));
    }
}
