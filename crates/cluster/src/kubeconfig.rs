//! Reading and merging the user's kubeconfig.
//!
//! Only the cluster, user and context entries named after a profile are ever
//! touched. Everything else in the file, including fields this model does not
//! know about, is written back unchanged.
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::lock::FileLock;

pub const KUBECONFIG: &str = "KUBECONFIG";

const EXTENSION_NAME: &str = "cluster_info";
const PROVIDER: &str = "minikube.sigs.k8s.io";
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Returns the kubeconfig path from the environment variable, using the
/// first entry when it holds a list.
pub fn path() -> Option<PathBuf> {
    env::var_os(KUBECONFIG)
        .and_then(|v| env::split_paths(&v).find(|p| !p.as_os_str().is_empty()))
        .or_else(default_path)
}

/// Returns kubeconfig path from `$HOME/.kube/config`.
pub fn default_path() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".kube").join("config"))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    pub current_context: String,
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub preferences: serde_yaml::Value,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<NamedExtension>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<NamedExtension>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedExtension {
    pub name: String,
    pub extension: serde_yaml::Value,
}

impl Config {
    fn empty() -> Self {
        Config {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            preferences: serde_yaml::Value::Mapping(Default::default()),
            ..Default::default()
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name).map(|c| &c.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }

    pub fn context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts.iter().find(|c| c.name == name).map(|c| &c.context)
    }

    /// Removes the entries named `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.clusters.len() + self.users.len() + self.contexts.len();
        self.clusters.retain(|c| c.name != name);
        self.users.retain(|u| u.name != name);
        self.contexts.retain(|c| c.name != name);
        let removed = before != self.clusters.len() + self.users.len() + self.contexts.len();
        if self.current_context == name {
            self.current_context.clear();
        }
        removed
    }
}

fn upsert<T>(entries: &mut Vec<T>, name: &str, name_of: impl Fn(&T) -> &str, entry: T) {
    match entries.iter_mut().find(|e| name_of(e) == name) {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

/// What to write for one profile.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub cluster_name: String,
    pub namespace: String,
    /// `https://host:port`.
    pub server: String,
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
    pub certificate_authority: PathBuf,
    pub embed_certs: bool,
    pub keep_context: bool,
    pub version: String,
}

impl Settings {
    fn extension(&self) -> NamedExtension {
        let mut m = serde_yaml::Mapping::new();
        m.insert("provider".into(), PROVIDER.into());
        m.insert("version".into(), self.version.clone().into());
        m.insert(
            "last-update".into(),
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S UTC").to_string().into(),
        );
        NamedExtension {
            name: EXTENSION_NAME.to_string(),
            extension: serde_yaml::Value::Mapping(m),
        }
    }

    /// Merges the entries for this profile into `cfg`.
    pub async fn populate(&self, cfg: &mut Config) -> anyhow::Result<()> {
        let name = self.cluster_name.as_str();
        let mut cluster = Cluster {
            server: self.server.clone(),
            extensions: vec![self.extension()],
            ..Default::default()
        };
        let mut user = User::default();
        if self.embed_certs {
            cluster.certificate_authority_data = Some(read_base64(&self.certificate_authority).await?);
            user.client_certificate_data = Some(read_base64(&self.client_certificate).await?);
            user.client_key_data = Some(read_base64(&self.client_key).await?);
        } else {
            cluster.certificate_authority = Some(self.certificate_authority.display().to_string());
            user.client_certificate = Some(self.client_certificate.display().to_string());
            user.client_key = Some(self.client_key.display().to_string());
        }
        upsert(&mut cfg.clusters, name, |c| c.name.as_str(), NamedCluster {
            name: name.to_string(),
            cluster,
        });
        upsert(&mut cfg.users, name, |u| u.name.as_str(), NamedUser {
            name: name.to_string(),
            user,
        });
        upsert(&mut cfg.contexts, name, |c| c.name.as_str(), NamedContext {
            name: name.to_string(),
            context: ContextEntry {
                cluster: name.to_string(),
                user: name.to_string(),
                namespace: self.namespace.clone(),
                extensions: vec![self.extension()],
                ..Default::default()
            },
        });
        if !self.keep_context {
            cfg.current_context = name.to_string();
        }
        Ok(())
    }
}

async fn read_base64(path: &Path) -> anyhow::Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(base64::encode(data))
}

/// Reads the kubeconfig at `path`, or an empty one if the file is missing.
pub async fn read_or_new(path: &Path) -> anyhow::Result<Config> {
    match tokio::fs::read(path).await {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(Config::empty()),
        Ok(raw) => serde_yaml::from_slice(&raw)
            .with_context(|| format!("decoding kubeconfig {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::empty()),
        Err(e) => Err(e).with_context(|| format!("reading kubeconfig {}", path.display())),
    }
}

/// Writes `cfg` to `path` through a temporary file and a rename.
pub async fn write(path: &Path, cfg: &Config) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("kubeconfig path {} has no parent", path.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let data = serde_yaml::to_vec(cfg)?;
    let tmp = path.with_extension("tmp");
    crate::config::write_private(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Runs `f` on the kubeconfig at `path` under its lock and writes it back
/// when `f` returns true.
async fn modify<F>(path: &Path, f: F) -> anyhow::Result<bool>
where
    F: FnOnce(&mut Config) -> bool,
{
    let _lock = FileLock::acquire(lock_path(path), LOCK_TIMEOUT).await?;
    let mut cfg = read_or_new(path).await?;
    let changed = f(&mut cfg);
    if changed {
        write(path, &cfg).await?;
    }
    Ok(changed)
}

/// Creates or updates the context for a profile.
#[instrument(level = "info", skip(settings), fields(context = %settings.cluster_name))]
pub async fn update(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let _lock = FileLock::acquire(lock_path(path), LOCK_TIMEOUT).await?;
    let mut cfg = read_or_new(path).await?;
    settings.populate(&mut cfg).await?;
    write(path, &cfg).await?;
    info!(path = %path.display(), "updated kubeconfig");
    Ok(())
}

/// Removes the cluster, user and context named `name`.
pub async fn delete_context(path: &Path, name: &str) -> anyhow::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let removed = modify(path, |cfg| {
        let cleared = cfg.current_context == name;
        cfg.remove(name) || cleared
    })
    .await?;
    debug!(name, removed, "deleted kubeconfig context");
    Ok(removed)
}

/// Points `current-context` at `name`.
pub async fn set_current_context(path: &Path, name: &str) -> anyhow::Result<()> {
    modify(path, |cfg| {
        if cfg.current_context == name {
            return false;
        }
        cfg.current_context = name.to_string();
        true
    })
    .await?;
    Ok(())
}

/// Clears `current-context`.
pub async fn unset_current_context(path: &Path) -> anyhow::Result<()> {
    modify(path, |cfg| !std::mem::take(&mut cfg.current_context).is_empty()).await?;
    Ok(())
}

/// The server host and port recorded for `name`.
pub async fn endpoint(path: &Path, name: &str) -> anyhow::Result<(String, u16)> {
    let cfg = read_or_new(path).await?;
    let cluster = cfg.cluster(name).ok_or_else(|| {
        anyhow::anyhow!("{} context is not found in {}", name, path.display())
    })?;
    parse_server(&cluster.server)
}

/// `https://host:port`, bracketing IPv6 hosts.
pub fn server_url(host: &str, port: u16) -> String {
    format!("https://{}:{}", crate::command::bracket_ipv6(host), port)
}

fn parse_server(server: &str) -> anyhow::Result<(String, u16)> {
    let url = url::Url::parse(server).with_context(|| format!("parsing server {:?}", server))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("server {:?} has no host", server))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}

/// Whether the recorded endpoint for `name` matches `host:port`.
pub async fn verify_endpoint(path: &Path, name: &str, host: &str, port: u16) -> anyhow::Result<bool> {
    let (h, p) = endpoint(path, name).await?;
    Ok(h == host && p == port)
}

/// Rewrites the server of `name` to `host:port`. Returns whether it changed.
pub async fn update_endpoint(path: &Path, name: &str, host: &str, port: u16) -> anyhow::Result<bool> {
    let server = server_url(host, port);
    let name = name.to_string();
    modify(path, move |cfg| {
        match cfg.clusters.iter_mut().find(|c| c.name == name) {
            Some(c) if c.cluster.server != server => {
                c.cluster.server = server;
                true
            }
            _ => false,
        }
    })
    .await
}

/// A client for the context named `name`.
pub async fn client(path: &Path, name: &str) -> anyhow::Result<kube::Client> {
    let kubeconfig = kube::config::Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("loading kubeconfig {}: {}", path.display(), e))?;
    let options = kube::config::KubeConfigOptions {
        context: Some(name.to_string()),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| anyhow::anyhow!("building client for context {}: {}", name, e))?;
    Ok(kube::Client::try_from(config)?)
}

/// A client built from `settings` alone, without reading or writing the
/// user's kubeconfig.
pub async fn client_for(settings: &Settings) -> anyhow::Result<kube::Client> {
    let mut cfg = Config::empty();
    settings.populate(&mut cfg).await?;
    let kubeconfig: kube::config::Kubeconfig =
        serde_yaml::from_str(&serde_yaml::to_string(&cfg)?).context("converting kubeconfig")?;
    let options = kube::config::KubeConfigOptions {
        context: Some(settings.cluster_name.clone()),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| anyhow::anyhow!("building client for {}: {}", settings.cluster_name, e))?;
    Ok(kube::Client::try_from(config)?)
}

#[cfg(test)]
mod test {
    use super::*;

    const EXISTING: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    server: https://other.example.com
    insecure-skip-tls-verify: true
  name: other
contexts:
- context:
    cluster: other
    user: other
  name: other
current-context: other
users:
- name: other
  user:
    token: abc
"#;

    fn settings(dir: &Path, embed: bool, keep: bool) -> Settings {
        Settings {
            cluster_name: "minikube".to_string(),
            namespace: "default".to_string(),
            server: "https://192.168.49.2:8443".to_string(),
            client_certificate: dir.join("client.crt"),
            client_key: dir.join("client.key"),
            certificate_authority: dir.join("ca.crt"),
            embed_certs: embed,
            keep_context: keep,
            version: "v1.35.0".to_string(),
        }
    }

    #[tokio::test]
    async fn update_merges_and_preserves_unknown_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        tokio::fs::write(&path, EXISTING).await.expect("seed");

        update(&path, &settings(dir.path(), false, false)).await.expect("update");
        let cfg = read_or_new(&path).await.expect("read");
        assert_eq!(cfg.current_context, "minikube");
        assert_eq!(cfg.clusters.len(), 2);
        let other = cfg.cluster("other").expect("other cluster");
        assert!(other.other.contains_key("insecure-skip-tls-verify"));
        assert!(cfg.user("other").expect("other user").other.contains_key("token"));
        let mk = cfg.cluster("minikube").expect("minikube cluster");
        assert_eq!(mk.server, "https://192.168.49.2:8443");
        assert_eq!(
            mk.certificate_authority.as_deref(),
            Some(dir.path().join("ca.crt").display().to_string().as_str())
        );
        assert!(!lock_path(&path).exists());
    }

    #[tokio::test]
    async fn embedding_and_keep_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        for f in ["ca.crt", "client.crt", "client.key"] {
            tokio::fs::write(dir.path().join(f), f).await.expect("cert");
        }
        let path = dir.path().join("kube").join("config");
        tokio::fs::create_dir_all(path.parent().expect("parent")).await.expect("mkdir");
        tokio::fs::write(&path, EXISTING).await.expect("seed");

        update(&path, &settings(dir.path(), true, true)).await.expect("update");
        let cfg = read_or_new(&path).await.expect("read");
        assert_eq!(cfg.current_context, "other");
        let user = cfg.user("minikube").expect("user");
        assert_eq!(user.client_key_data.as_deref(), Some(base64::encode("client.key").as_str()));
        assert!(user.client_key.is_none());
    }

    #[tokio::test]
    async fn delete_context_clears_current() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        update(&path, &settings(dir.path(), false, false)).await.expect("update");

        assert!(delete_context(&path, "minikube").await.expect("delete"));
        let cfg = read_or_new(&path).await.expect("read");
        assert!(cfg.clusters.is_empty() && cfg.users.is_empty() && cfg.contexts.is_empty());
        assert_eq!(cfg.current_context, "");
        assert!(!delete_context(&path, "minikube").await.expect("delete again"));
        assert!(!delete_context(&dir.path().join("missing"), "minikube").await.expect("missing"));
    }

    #[tokio::test]
    async fn endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        update(&path, &settings(dir.path(), false, false)).await.expect("update");

        assert_eq!(
            endpoint(&path, "minikube").await.expect("endpoint"),
            ("192.168.49.2".to_string(), 8443)
        );
        assert!(verify_endpoint(&path, "minikube", "192.168.49.2", 8443).await.expect("verify"));
        assert!(update_endpoint(&path, "minikube", "127.0.0.1", 52011).await.expect("update"));
        assert!(!update_endpoint(&path, "minikube", "127.0.0.1", 52011).await.expect("no-op"));
        assert_eq!(
            endpoint(&path, "minikube").await.expect("endpoint"),
            ("127.0.0.1".to_string(), 52011)
        );
        assert!(endpoint(&path, "nope").await.is_err());
    }

    #[test]
    fn ipv6_servers() {
        assert_eq!(
            parse_server("https://[fd00::2]:8443").expect("parse"),
            ("fd00::2".to_string(), 8443)
        );
    }
}
