//! `minikube delete`.
//!
//! Deleting converges: a profile whose machines are already gone, whose
//! machine config is empty or whose own config is corrupt is still removed,
//! and the command succeeds.
use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::config::{self, machine_name, ConfigError, Settings, UserConfig};
use crate::driver::{self, kic};
use crate::host;
use crate::kubeconfig;
use crate::machine::MachineStore;
use crate::mount;
use crate::out::{Icon, Out};
use crate::reason;

use super::PROFILE_LOCK_TIMEOUT;

/// How a profile deletion failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionKind {
    /// Something could not be removed.
    Fatal,
    /// There is no profile with that name.
    MissingProfile,
    /// The profile exists but its machine does not.
    MissingCluster,
}

#[derive(Debug)]
pub struct DeletionError {
    pub kind: DeletionKind,
    pub err: anyhow::Error,
}

impl DeletionError {
    fn fatal(err: impl Into<anyhow::Error>) -> Self {
        DeletionError {
            kind: DeletionKind::Fatal,
            err: err.into(),
        }
    }
}

impl fmt::Display for DeletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.err)
    }
}

impl std::error::Error for DeletionError {}

/// Flags of `minikube delete`.
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub all: bool,
    pub purge: bool,
}

/// Deletes one profile: its machines, leftover containers, the mount
/// process, the profile directory and its kubeconfig context.
#[instrument(level = "info", skip(settings, out))]
pub async fn delete_profile(settings: &Settings, name: &str, out: &Out) -> Result<(), DeletionError> {
    let store = settings.store();
    let machines = MachineStore::new(settings.home.clone());
    let loaded = store.load(name).await;
    if let Err(ConfigError::NotFound(_)) = &loaded {
        if tokio::fs::metadata(settings.home.profile(name)).await.is_err() && !machines.exists(name).await {
            return Err(DeletionError {
                kind: DeletionKind::MissingProfile,
                err: anyhow::anyhow!("Profile \"{}\" not found", name),
            });
        }
    }
    let _lock = store
        .lock(name, PROFILE_LOCK_TIMEOUT)
        .await
        .map_err(DeletionError::fatal)?;

    let mut missing_cluster = false;
    match loaded {
        Ok(cc) => {
            out.step(
                Icon::Deleting,
                format!("Deleting \"{}\" in {} ...", name, driver::full_name(&cc.driver)),
            );
            if driver::is_kic(&cc.driver) {
                if let Err(e) = kic::delete_owned(&cc.driver, Some(name)).await {
                    warn!(profile = name, error = %e, "removing leftover containers");
                }
            }
            for node in &cc.nodes {
                let machine = machine_name(&cc, node);
                if !machines.exists(&machine).await {
                    debug!(%machine, "machine already gone");
                    missing_cluster = true;
                }
                host::delete_host(&machines, &machine)
                    .await
                    .map_err(|e| DeletionError::fatal(reason::with_kind(reason::GUEST_DELETION, e)))?;
            }
        }
        Err(e) => {
            // Without a readable config only the machine sharing the
            // profile's name can be found.
            warn!(profile = name, error = %e, "deleting profile with an unreadable config");
            out.step(Icon::Deleting, format!("Deleting \"{}\" ...", name));
            if let Err(e) = host::delete_host(&machines, name).await {
                warn!(profile = name, error = %e, "removing machine");
            }
        }
    }

    if let Err(e) = mount::kill_mount_process(&settings.home, name).await {
        warn!(profile = name, error = %e, "stopping mount process");
    }
    store
        .delete(name)
        .await
        .map_err(|e| DeletionError::fatal(reason::with_kind(reason::GUEST_PROFILE_DELETION, e)))?;
    if let Err(e) = kubeconfig::delete_context(&settings.kubeconfig, name).await {
        out.warning(format!("Unable to remove \"{}\" from the kubeconfig: {:#}", name, e));
    }
    if let Err(e) = unset_active(settings, name).await {
        warn!(profile = name, error = %e, "clearing the active profile");
    }
    out.step(Icon::Deleting, format!("Removed all traces of the \"{}\" cluster.", name));
    info!(profile = name, missing_cluster, "profile deleted");
    if missing_cluster {
        return Err(DeletionError {
            kind: DeletionKind::MissingCluster,
            err: anyhow::anyhow!("the machines of profile \"{}\" did not exist", name),
        });
    }
    Ok(())
}

async fn unset_active(settings: &Settings, name: &str) -> anyhow::Result<()> {
    let current = UserConfig::read(&settings.home.config_file()).await?;
    if current.get_str(config::user::PROFILE) != Some(name) {
        return Ok(());
    }
    UserConfig::update(&settings.home, |c| c.unset(config::user::PROFILE)).await
}

/// Removes the whole minikube home.
async fn purge(settings: &Settings, out: &Out) -> anyhow::Result<()> {
    let root = settings.home.root();
    out.step(Icon::Deleting, format!("Purging the '{}' directory...", root.display()));
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(reason::with_kind(
            reason::HOST_PURGE,
            anyhow::Error::new(e).context(format!("unable to delete {}", root.display())),
        )),
    }
}

/// Runs `minikube delete` for the profile in `settings`, or for every
/// profile with `--all`.
pub async fn delete(settings: &Settings, opts: &DeleteOptions) -> anyhow::Result<()> {
    let out = settings.out();
    let store = settings.store();
    let profiles = store.list().await?;
    let count = profiles.valid.len() + profiles.invalid.len();
    if opts.purge && !opts.all && count > 1 {
        return Err(reason::usage(format!(
            "Multiple minikube profiles were found, use --all together with --purge to remove them:\n{}",
            profiles
                .valid
                .iter()
                .chain(profiles.invalid.iter())
                .map(|p| format!("\t{}", p.name))
                .collect::<Vec<_>>()
                .join("\n")
        )));
    }

    if opts.all {
        let mut failures = Vec::new();
        for p in profiles.valid.iter().chain(profiles.invalid.iter()) {
            match delete_profile(settings, &p.name, &out).await {
                Ok(()) => {}
                Err(e) if e.kind == DeletionKind::Fatal => failures.push(format!("{}: {}", p.name, e)),
                Err(e) => debug!(profile = %p.name, error = %e, "partial profile removed"),
            }
        }
        let mut ocis: Vec<&str> = profiles
            .valid
            .iter()
            .filter_map(|p| p.config.as_ref())
            .map(|cc| cc.driver.as_str())
            .filter(|d| driver::is_kic(d))
            .collect();
        ocis.sort_unstable();
        ocis.dedup();
        for oci in ocis {
            if which::which(oci).is_ok() {
                if let Err(e) = kic::delete_owned(oci, None).await {
                    warn!(oci, error = %e, "removing leftover containers");
                }
            }
        }
        if !failures.is_empty() {
            return Err(reason::with_kind(
                reason::GUEST_DELETION,
                anyhow::anyhow!("Failed to delete profiles:\n{}", failures.join("\n")),
            ));
        }
        out.step(Icon::Deleting, "Successfully deleted all profiles");
    } else {
        match delete_profile(settings, &settings.profile, &out).await {
            Ok(()) => {}
            Err(e) if e.kind == DeletionKind::MissingProfile => {
                out.warning(format!("\"{}\" profile does not exist, trying anyways.", settings.profile));
                if let Err(e) = mount::kill_mount_process(&settings.home, &settings.profile).await {
                    warn!(error = %e, "stopping mount process");
                }
                if let Err(e) = kubeconfig::delete_context(&settings.kubeconfig, &settings.profile).await {
                    warn!(error = %e, "removing kubeconfig context");
                }
            }
            Err(e) if e.kind == DeletionKind::MissingCluster => {
                debug!(error = %e, "profile removed without its machines");
            }
            Err(e) => {
                return Err(match reason::kind_of(&e.err) {
                    Some(_) => e.err,
                    None => reason::with_kind(reason::GUEST_DELETION, e.err),
                })
            }
        }
    }

    if opts.purge {
        purge(settings, &out).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;
    use crate::localpath::MiniHome;
    use crate::out::Format;

    fn settings(dir: &std::path::Path, profile: &str) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir.join(".minikube")));
        s.profile = profile.to_string();
        s.kubeconfig = dir.join("kubeconfig");
        s.output = Format::Json;
        s
    }

    async fn machine_dirs(s: &Settings) -> usize {
        MachineStore::new(s.home.clone()).list().await.expect("machines").len()
    }

    #[tokio::test]
    async fn profiles_without_machines_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = settings(dir.path(), "p1");
        let store = s.store();
        store.save("p1", &cluster("p1", "kvm2", 0)).await.expect("save");
        store.save("p2", &cluster("p2", "kvm2", 0)).await.expect("save");
        tokio::fs::create_dir_all(s.home.machine("p2")).await.expect("machine dir");

        let before = machine_dirs(&s).await;
        delete(&s, &DeleteOptions::default()).await.expect("delete");
        assert!(!store.exists("p1").await);
        assert_eq!(store.list().await.expect("list").valid.len(), 1);
        assert_eq!(machine_dirs(&s).await, before);
    }

    #[tokio::test]
    async fn corrupt_profiles_and_empty_machines_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = settings(dir.path(), "broken");
        tokio::fs::create_dir_all(s.home.profile("broken")).await.expect("profile dir");
        tokio::fs::write(s.home.profile_config("broken"), b"{not json").await.expect("write");
        tokio::fs::create_dir_all(s.home.machine("broken")).await.expect("machine dir");
        tokio::fs::write(s.home.machine("broken").join("config.json"), b"").await.expect("write");

        delete(&s, &DeleteOptions::default()).await.expect("delete");
        assert!(tokio::fs::metadata(s.home.profile("broken")).await.is_err());
        assert!(tokio::fs::metadata(s.home.machine("broken")).await.is_err());
    }

    #[tokio::test]
    async fn missing_profiles_report_their_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = settings(dir.path(), "ghost");
        let err = delete_profile(&s, "ghost", &s.out()).await.expect_err("missing");
        assert_eq!(err.kind, DeletionKind::MissingProfile);
        delete(&s, &DeleteOptions::default()).await.expect("delete still succeeds");
        assert!(tokio::fs::metadata(s.home.profile("ghost")).await.is_err());
    }

    #[tokio::test]
    async fn purge_needs_all_with_several_profiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = settings(dir.path(), "p1");
        let store = s.store();
        store.save("p1", &cluster("p1", "kvm2", 0)).await.expect("save");
        store.save("p2", &cluster("p2", "kvm2", 1)).await.expect("save");
        let opts = DeleteOptions {
            all: false,
            purge: true,
        };
        let err = delete(&s, &opts).await.expect_err("purge");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));

        let opts = DeleteOptions { all: true, purge: true };
        delete(&s, &opts).await.expect("delete all");
        assert!(tokio::fs::metadata(s.home.root()).await.is_err());
    }

    #[tokio::test]
    async fn the_active_profile_is_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = settings(dir.path(), "p1");
        s.store().save("p1", &cluster("p1", "kvm2", 0)).await.expect("save");
        UserConfig::update(&s.home, |c| c.set(config::user::PROFILE, "p1"))
            .await
            .expect("set");
        delete(&s, &DeleteOptions::default()).await.expect("delete");
        let cfg = UserConfig::read(&s.home.config_file()).await.expect("read");
        assert_eq!(cfg.get_str(config::user::PROFILE), None);
    }
}
