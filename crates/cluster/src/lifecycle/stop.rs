//! `minikube stop`.
use tracing::warn;

use crate::config::{machine_name, Settings};
use crate::host;
use crate::machine::MachineStore;
use crate::mount;
use crate::out::Icon;

use super::load_config;

/// Stops every node of one profile in registration order. Returns how many
/// nodes were stopped.
pub async fn stop_profile(settings: &Settings, name: &str) -> anyhow::Result<usize> {
    let out = settings.out();
    let cc = load_config(&settings.store(), name).await?;
    let machines = MachineStore::new(settings.home.clone());
    let mut stopped = 0;
    for node in &cc.nodes {
        let machine = machine_name(&cc, node);
        out.step(Icon::Stopping, format!("Stopping node \"{}\"  ...", machine));
        host::stop_host(&machines, &machine).await?;
        stopped += 1;
    }
    if let Err(e) = mount::kill_mount_process(&settings.home, name).await {
        warn!(profile = name, error = %e, "stopping mount process");
    }
    Ok(stopped)
}

/// Stops the profile in `settings`, or every valid profile with `all`.
pub async fn stop(settings: &Settings, all: bool) -> anyhow::Result<usize> {
    let out = settings.out();
    let names: Vec<String> = if all {
        settings
            .store()
            .list_valid()
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect()
    } else {
        vec![settings.profile.clone()]
    };
    let mut stopped = 0;
    for name in &names {
        stopped += stop_profile(settings, name).await?;
    }
    out.step(Icon::Stopping, format!("{} node(s) stopped.", stopped));
    Ok(stopped)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::localpath::MiniHome;

    #[tokio::test]
    async fn stopping_a_missing_profile_is_guest_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::new(MiniHome::new(dir.path()));
        settings.profile = "ghost".to_string();
        let err = stop(&settings, false).await.expect_err("missing");
        assert_eq!(crate::reason::kind_of(&err).map(|k| k.id), Some("GUEST_NOT_FOUND"));
        assert_eq!(stop(&settings, true).await.expect("no profiles"), 0);
    }

    #[tokio::test]
    async fn machines_that_never_existed_fail_to_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::new(MiniHome::new(dir.path()));
        let cc = crate::lifecycle::test::cluster("minikube", "kvm2", 0);
        settings.store().save("minikube", &cc).await.expect("save");
        let err = stop_profile(&settings, "minikube").await.expect_err("no machine");
        assert_eq!(crate::reason::kind_of(&err).map(|k| k.id), Some("GUEST_LOAD_HOST"));
    }
}
