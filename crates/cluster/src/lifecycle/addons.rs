//! `minikube addons`.
use std::path::Path;
use std::sync::Arc;

use machine_rpc::MachineState;
use tracing::debug;

use crate::addons::{self, configure, scan};
use crate::command::{ExecRunner, Runner};
use crate::config::{ClusterConfig, Settings};
use crate::out::Format;
use crate::reason;

use super::{load_config, NodeHandle, PROFILE_LOCK_TIMEOUT};

/// The primary control plane's runner, or `None` when it is not running.
async fn running_runner(settings: &Settings, cc: &ClusterConfig) -> Option<Arc<dyn Runner>> {
    let node = cc.primary_control_plane().ok()?;
    let handle = match NodeHandle::load(&settings.home, cc, &node).await {
        Ok(h) => h,
        Err(e) => {
            debug!(profile = %cc.name, error = %e, "control plane does not load");
            return None;
        }
    };
    match handle.state().await {
        Ok(MachineState::Running) => Some(handle.runner),
        _ => None,
    }
}

/// `addons enable NAME` and `addons disable NAME`.
///
/// A stopped cluster only records the new state; it takes effect on the
/// next start.
pub async fn set(settings: &Settings, name: &str, enable: bool) -> anyhow::Result<()> {
    let store = settings.store();
    addons::find(name).map_err(|e| reason::with_kind(reason::INTERNAL_ADDON_ENABLE, e))?;
    let mut cc = load_config(&store, &settings.profile).await?;
    let _lock = store.lock(&settings.profile, PROFILE_LOCK_TIMEOUT).await?;
    let runner = running_runner(settings, &cc).await;
    let kind = if enable {
        reason::INTERNAL_ADDON_ENABLE
    } else {
        reason::INTERNAL_ADDON_DISABLE
    };
    addons::set(&store, runner.as_deref(), &mut cc, name, enable, &settings.out())
        .await
        .map_err(|e| match reason::kind_of(&e) {
            Some(_) => e,
            None => reason::with_kind(kind, e),
        })
}

/// `addons list`, as a table or as JSON.
pub async fn list(settings: &Settings) -> anyhow::Result<String> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    match settings.output {
        Format::Json => addons::list_json(&cc),
        Format::Text => Ok(addons::list_table(&cc)),
    }
}

/// `addons images NAME`.
pub async fn images(settings: &Settings, name: &str) -> anyhow::Result<Vec<(String, String)>> {
    let cc = match settings.store().load(&settings.profile).await {
        Ok(cc) => cc,
        Err(_) => ClusterConfig::new(&settings.profile),
    };
    addons::images(&cc, name).map_err(|e| reason::with_kind(reason::INTERNAL_ADDON_ENABLE, e))
}

/// `addons configure NAME`.
pub async fn configure(
    settings: &Settings,
    name: &str,
    config_file: Option<&Path>,
    prompt: &mut dyn configure::Prompt,
) -> anyhow::Result<()> {
    let store = settings.store();
    let mut cc = load_config(&store, &settings.profile).await?;
    let runner = running_runner(settings, &cc).await;
    let out = settings.out();
    let env = configure::Env {
        store: &store,
        runner: runner.as_deref(),
        kubeconfig: &settings.kubeconfig,
        out: &out,
        config_file,
    };
    configure::configure(&env, &mut cc, name, prompt).await
}

/// `addons scan`: scans the images of the addon list at `source` with the
/// host's scanner and rewrites `status_path`.
pub async fn scan(source: &str, status_path: &Path) -> anyhow::Result<scan::StatusFile> {
    let list = scan::fetch_addon_list(source)
        .await
        .map_err(|e| reason::with_kind(reason::INET_ADDON_LIST, e))?;
    scan::scan(&ExecRunner::new(), &list, status_path).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;
    use crate::localpath::MiniHome;

    fn settings(dir: &Path) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir));
        s.output = Format::Json;
        s
    }

    #[tokio::test]
    async fn stopped_clusters_record_the_addon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        settings
            .store()
            .save("minikube", &cluster("minikube", "kvm2", 0))
            .await
            .expect("save");
        set(&settings, "metrics-server", true).await.expect("enable");
        let cc = settings.store().load("minikube").await.expect("load");
        assert!(cc.addon_enabled("metrics-server"));

        let listed: serde_json::Value = serde_json::from_str(&list(&settings).await.expect("list")).expect("json");
        assert_eq!(listed["metrics-server"]["Status"], "enabled");
        assert_eq!(listed["metrics-server"]["Profile"], "minikube");

        set(&settings, "metrics-server", false).await.expect("disable");
        let cc = settings.store().load("minikube").await.expect("load");
        assert!(!cc.addon_enabled("metrics-server"));
    }

    #[tokio::test]
    async fn unknown_addons_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let err = set(&settings, "no-such-addon", true).await.expect_err("unknown");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_ADDON_ENABLE"));
        assert!(images(&settings, "no-such-addon").await.is_err());
        assert!(!images(&settings, "metrics-server").await.expect("images").is_empty());
    }

    #[tokio::test]
    async fn enabling_needs_a_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = set(&settings(dir.path()), "dashboard", true).await.expect_err("no profile");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("GUEST_NOT_FOUND"));
    }
}
