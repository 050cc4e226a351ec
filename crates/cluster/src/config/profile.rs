use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{machine_name, ClusterConfig, ConfigError, Node};
use crate::localpath::MiniHome;
use crate::lock::FileLock;

/// A profile found on disk. `config` is `None` when it could not be loaded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Profile {
    pub name: String,
    pub status: String,
    pub config: Option<ClusterConfig>,
    pub active: bool,
}

impl Profile {
    /// A profile is valid when its config loaded, names a driver and every
    /// node carries a Kubernetes version.
    pub fn is_valid(&self) -> bool {
        match &self.config {
            None => false,
            Some(cc) => {
                !cc.driver.is_empty() && cc.nodes.iter().all(|n| !n.kubernetes_version.is_empty())
            }
        }
    }
}

/// The result of listing every profile.
#[derive(Debug, Default, Serialize)]
pub struct ProfileList {
    pub valid: Vec<Profile>,
    pub invalid: Vec<Profile>,
}

/// Persistent storage of profiles under a minikube home.
///
/// The store is the only writer of profile config files.
#[derive(Clone, Debug)]
pub struct Store {
    home: MiniHome,
}

impl Store {
    pub fn new(home: MiniHome) -> Self {
        Store { home }
    }

    pub fn home(&self) -> &MiniHome {
        &self.home
    }

    /// Whether `name` has a config file.
    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.home.profile_config(name))
            .await
            .is_ok()
    }

    /// Loads and upgrades a profile's config.
    pub async fn load(&self, name: &str) -> Result<ClusterConfig, ConfigError> {
        let path = self.home.profile_config(name);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(name.to_string()))
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let mut cc: ClusterConfig =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Corrupt {
                path: path.clone(),
                source,
            })?;
        cc.upgrade(name);
        Ok(cc)
    }

    /// Atomically writes a profile's config.
    ///
    /// The profile directory is created `0700` and the file `0600`. The
    /// new contents are written to a temporary file in the same directory,
    /// synced and renamed over the old file.
    #[instrument(level = "info", skip(self, cc))]
    pub async fn save(&self, name: &str, cc: &ClusterConfig) -> anyhow::Result<()> {
        let path = self.home.profile_config(name);
        let dir = self.home.profile(name);
        info!(path = %path.display(), "saving profile config");
        create_private_dir(&dir).await?;

        let data = to_json_indented(cc)?;
        let tmp = dir.join(format!("config.json.tmp.{}", std::process::id()));
        let result = write_private(&tmp, &data).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))
    }

    /// Updates `node` in `cc` and persists the result.
    pub async fn save_node(&self, cc: &mut ClusterConfig, node: Node) -> anyhow::Result<()> {
        cc.save_node(node);
        let name = cc.name.clone();
        self.save(&name, cc).await
    }

    /// Creates a profile holding an otherwise empty config.
    pub async fn create_empty(&self, name: &str) -> anyhow::Result<()> {
        self.save(name, &ClusterConfig::default()).await
    }

    /// Removes a profile's directory and everything in it.
    pub async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let dir = self.home.profile(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }

    /// Takes the cooperative per-profile lock.
    pub async fn lock(&self, name: &str, timeout: Duration) -> anyhow::Result<FileLock> {
        FileLock::acquire(self.home.profile(name).join(".lock"), timeout).await
    }

    /// Loads a profile for listing. Load failures yield a profile without a
    /// config rather than an error.
    pub async fn load_profile(&self, name: &str) -> Profile {
        let config = match self.load(name).await {
            Ok(cc) => Some(cc),
            Err(e) => {
                debug!(profile = %name, error = %e, "profile did not load");
                None
            }
        };
        Profile {
            name: name.to_string(),
            config,
            ..Default::default()
        }
    }

    /// Lists the profile directories.
    pub async fn list(&self) -> anyhow::Result<ProfileList> {
        self.list_with(Vec::new()).await
    }

    /// Lists profiles, also considering `extra` names found outside the
    /// profiles directory, e.g. containers left by a container driver.
    ///
    /// Names are deduplicated. Invalid entries that are really the machines
    /// of a valid multi-node profile are dropped.
    pub async fn list_with(&self, extra: Vec<String>) -> anyhow::Result<ProfileList> {
        let mut names = self.profile_dirs().await?;
        names.extend(extra);

        let mut list = ProfileList::default();
        let mut machines = HashSet::new();
        for name in remove_dupes(names) {
            let p = self.load_profile(&name).await;
            if !p.is_valid() {
                list.invalid.push(p);
                continue;
            }
            if let Some(cc) = &p.config {
                for n in &cc.nodes {
                    machines.insert(machine_name(cc, n));
                }
            }
            list.valid.push(p);
        }
        list.invalid.retain(|p| !machines.contains(&p.name));
        Ok(list)
    }

    /// Lists only the valid profiles.
    pub async fn list_valid(&self) -> anyhow::Result<Vec<Profile>> {
        Ok(self.list().await?.valid)
    }

    async fn profile_dirs(&self) -> anyhow::Result<Vec<String>> {
        let root = self.home.profiles_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", root.display())),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn remove_dupes(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

pub(crate) fn to_json_indented<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .context("encoding config as JSON")?;
    Ok(buf)
}

pub(crate) async fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("restricting {}", dir.display()))?;
    }
    Ok(())
}

pub(crate) async fn write_private(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut f = opts
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    f.write_all(data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    f.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Node;

    fn valid(name: &str, nodes: usize) -> ClusterConfig {
        let mut cc = ClusterConfig::new(name);
        cc.driver = "docker".to_string();
        cc.memory = 2200;
        for i in 0..nodes {
            cc.nodes.push(Node {
                name: if i == 0 {
                    String::new()
                } else {
                    format!("m{:02}", i + 1)
                },
                kubernetes_version: "v1.34.0".to_string(),
                control_plane: i == 0,
                worker: true,
                ..Default::default()
            });
        }
        cc
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(MiniHome::new(dir.path()));
        let cc = valid("p1", 1);
        store.save("p1", &cc).await.expect("save");
        store.save("p1", &cc).await.expect("overwrite");
        assert_eq!(store.load("p1").await.expect("load"), cc);
        assert!(store.exists("p1").await);

        let raw = std::fs::read_to_string(store.home().profile_config("p1")).expect("read");
        assert!(raw.starts_with("{\n    \"Name\": \"p1\""));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.home().profile_config("p1"))
                .expect("stat")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn missing_and_corrupt_profiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(MiniHome::new(dir.path()));
        assert!(matches!(
            store.load("nope").await,
            Err(ConfigError::NotFound(_))
        ));
        let path = store.home().profile_config("bad");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            store.load("bad").await,
            Err(ConfigError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn listing_separates_invalid_and_drops_child_machines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(MiniHome::new(dir.path()));
        store.save("p1", &valid("p1", 1)).await.expect("save p1");
        store.save("multi", &valid("multi", 2)).await.expect("save multi");
        // Left behind by a node of "multi".
        std::fs::create_dir_all(store.home().profile("multi-m02")).expect("mkdir");
        // No driver.
        let mut broken = valid("p2", 1);
        broken.driver.clear();
        store.save("p2", &broken).await.expect("save p2");
        std::fs::create_dir_all(store.home().profile("p3")).expect("mkdir");

        let list = store
            .list_with(vec!["p1".to_string()])
            .await
            .expect("list");
        let valid: Vec<_> = list.valid.iter().map(|p| p.name.as_str()).collect();
        let invalid: Vec<_> = list.invalid.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(valid, vec!["multi", "p1"]);
        assert_eq!(invalid, vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn save_node_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(MiniHome::new(dir.path()));
        let mut cc = valid("p1", 1);
        store.save("p1", &cc).await.expect("save");
        store
            .save_node(
                &mut cc,
                Node {
                    name: "m02".to_string(),
                    kubernetes_version: "v1.34.0".to_string(),
                    worker: true,
                    ..Default::default()
                },
            )
            .await
            .expect("save node");
        assert_eq!(store.load("p1").await.expect("load").nodes.len(), 2);

        store.delete("p1").await.expect("delete");
        assert!(!store.exists("p1").await);
        store.delete("p1").await.expect("deleting twice is fine");
    }
}
