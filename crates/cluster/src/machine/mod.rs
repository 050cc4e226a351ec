//! Persisted machines.
//!
//! Every node has a machine directory, `<home>/machines/<machine name>`,
//! holding the driver's serialized state (`config.json`), its ssh key and
//! the TLS material of the docker daemon inside the guest.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::command::{ExecRunner, KicRunner, Runner, SshClient, SshRunner};
use crate::config::{create_private_dir, to_json_indented, write_private};
use crate::driver::{self, Driver, DriverCapability};
use crate::localpath::MiniHome;

const CONFIG_VERSION: u32 = 3;

/// Machine errors callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("machine \"{0}\" does not exist")]
    HostDoesNotExist(String),
    #[error("machine config {path} is empty")]
    Empty { path: PathBuf },
    #[error("machine config {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unable to read machine config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// TLS material of the docker daemon in the guest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthOptions {
    pub cert_dir: String,
    pub ca_cert_path: String,
    pub ca_private_key_path: String,
    pub ca_cert_remote_path: String,
    pub server_cert_path: String,
    pub server_key_path: String,
    pub client_key_path: String,
    pub server_cert_remote_path: String,
    pub server_key_remote_path: String,
    pub client_cert_path: String,
    #[serde(rename = "ServerCertSANs")]
    pub server_cert_sans: Vec<String>,
    pub store_path: String,
}

/// Settings for the docker daemon in the guest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EngineOptions {
    pub arbitrary_flags: Vec<String>,
    pub env: Vec<String>,
    pub insecure_registry: Vec<String>,
    pub labels: Vec<String>,
    pub registry_mirror: Vec<String>,
    pub storage_driver: String,
    #[serde(rename = "TlsVerify")]
    pub tls_verify: bool,
    #[serde(rename = "InstallURL")]
    pub install_url: String,
}

/// Unused by minikube, kept so configs written by other tools survive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SwarmOptions {
    pub is_swarm: bool,
    pub discovery: String,
    pub master: bool,
    pub host: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostOptions {
    pub driver: String,
    pub memory: u64,
    pub disk: u64,
    pub engine_options: EngineOptions,
    pub swarm_options: SwarmOptions,
    pub auth_options: AuthOptions,
}

/// A machine as persisted in its `config.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Host {
    pub config_version: u32,
    pub name: String,
    pub driver_name: String,
    /// The driver's own state, as returned by `GetConfigRaw`.
    pub raw_driver: Value,
    pub host_options: HostOptions,
}

impl Host {
    /// A new machine with auth paths under `home`.
    pub fn new(home: &MiniHome, name: &str, driver_name: &str, raw_driver: Value) -> Self {
        let mut host = Host {
            config_version: CONFIG_VERSION,
            name: name.to_string(),
            driver_name: driver_name.to_string(),
            raw_driver,
            host_options: HostOptions {
                driver: driver_name.to_string(),
                ..Default::default()
            },
        };
        host.host_options.auth_options = auth_options(home, name);
        host
    }

    /// Rehydrates the machine's driver.
    pub async fn driver(&self) -> anyhow::Result<Driver> {
        Driver::load(&self.driver_name, self.raw_driver.clone())
            .await
            .with_context(|| format!("loading the {} driver for {}", self.driver_name, self.name))
    }
}

fn auth_options(home: &MiniHome, name: &str) -> AuthOptions {
    let certs = home.certs_dir();
    let machine = home.machine(name);
    let path = |p: PathBuf| p.display().to_string();
    AuthOptions {
        cert_dir: path(certs.clone()),
        ca_cert_path: path(certs.join("ca.pem")),
        ca_private_key_path: path(certs.join("ca-key.pem")),
        ca_cert_remote_path: "/etc/docker/ca.pem".to_string(),
        server_cert_path: path(machine.join("server.pem")),
        server_key_path: path(machine.join("server-key.pem")),
        client_key_path: path(certs.join("key.pem")),
        server_cert_remote_path: "/etc/docker/server.pem".to_string(),
        server_key_remote_path: "/etc/docker/server-key.pem".to_string(),
        client_cert_path: path(certs.join("cert.pem")),
        server_cert_sans: Vec::new(),
        store_path: path(machine),
    }
}

/// Points every path recorded in `host` at `home`. Makes no driver call.
pub fn relocate(host: &mut Host, home: &MiniHome) {
    let root = home.root().display().to_string();
    let sans = std::mem::take(&mut host.host_options.auth_options.server_cert_sans);
    host.host_options.auth_options = auth_options(home, &host.name);
    host.host_options.auth_options.server_cert_sans = sans;

    if let Some(raw) = host.raw_driver.as_object_mut() {
        raw.insert("StorePath".to_string(), Value::String(root.clone()));
        let has_key = raw
            .get("SSHKeyPath")
            .and_then(Value::as_str)
            .map_or(false, |k| !k.is_empty());
        if has_key {
            let key = home.machine(&host.name).join("id_rsa");
            raw.insert(
                "SSHKeyPath".to_string(),
                Value::String(key.display().to_string()),
            );
        }
        if let Some(node_config) = raw.get_mut("NodeConfig").and_then(Value::as_object_mut) {
            node_config.insert("StorePath".to_string(), Value::String(root));
        }
    }
}

/// The machine directories under a minikube home.
#[derive(Clone, Debug)]
pub struct MachineStore {
    home: MiniHome,
}

impl MachineStore {
    pub fn new(home: MiniHome) -> Self {
        MachineStore { home }
    }

    pub fn home(&self) -> &MiniHome {
        &self.home
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.home.machine(name).join("config.json")
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::metadata(self.config_path(name)).await.is_ok()
    }

    pub async fn load(&self, name: &str) -> Result<Host, MachineError> {
        let path = self.config_path(name);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MachineError::HostDoesNotExist(name.to_string()))
            }
            Err(source) => return Err(MachineError::Io { path, source }),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(MachineError::Empty { path });
        }
        serde_json::from_slice(&data).map_err(|source| MachineError::Corrupt { path, source })
    }

    #[instrument(level = "debug", skip(self, host), fields(machine = %host.name))]
    pub async fn save(&self, host: &Host) -> anyhow::Result<()> {
        let dir = self.home.machine(&host.name);
        create_private_dir(&dir).await?;
        let path = self.config_path(&host.name);
        let tmp = dir.join(format!("config.json.tmp.{}", std::process::id()));
        write_private(&tmp, &to_json_indented(host)?).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))
    }

    /// Removes a machine directory. A missing directory is not an error.
    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let dir = self.home.machine(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(machine = name, "removed machine directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }

    /// Names of every machine directory, sorted.
    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.home.machines_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).context("listing machines"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Rewrites every machine config for the current home directory.
    pub async fn relocate_all(&self) -> anyhow::Result<usize> {
        let mut count = 0;
        for name in self.list().await? {
            let mut host = match self.load(&name).await {
                Ok(h) => h,
                Err(e) => {
                    debug!(machine = %name, error = %e, "skipping unreadable machine");
                    continue;
                }
            };
            relocate(&mut host, &self.home);
            self.save(&host).await?;
            count += 1;
        }
        info!(count, home = %self.home.root().display(), "relocated machines");
        Ok(count)
    }
}

/// Picks how to run commands on a machine: directly for the host itself,
/// through the container CLI when the node container lives on a remote
/// daemon, over ssh otherwise.
pub async fn command_runner(driver: &Driver, machine_name: &str) -> anyhow::Result<Arc<dyn Runner>> {
    let name = driver.driver_name();
    if driver::bare_metal(&name) {
        return Ok(Arc::new(ExecRunner::new()));
    }
    if driver::is_kic(&name) && driver::kic::external_daemon(&name) {
        return Ok(Arc::new(KicRunner::new(machine_name, name)));
    }
    let client = SshClient::new(
        driver.ssh_hostname().await?,
        driver.ssh_port().await?,
        driver.ssh_username().await?,
        driver.ssh_key_path().await?,
    );
    Ok(Arc::new(SshRunner::new(client)))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn kic_host(home: &MiniHome) -> Host {
        Host::new(
            home,
            "p1",
            "docker",
            json!({
                "MachineName": "p1",
                "StorePath": "/old/.minikube",
                "SSHKeyPath": "/old/.minikube/machines/p1/id_rsa",
                "NodeConfig": {"StorePath": "/old/.minikube", "ContainerName": "p1"}
            }),
        )
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MachineStore::new(MiniHome::new(dir.path()));
        let host = kic_host(store.home());
        store.save(&host).await.expect("save");
        assert!(store.exists("p1").await);
        assert_eq!(store.load("p1").await.expect("load"), host);
        assert_eq!(store.list().await.expect("list"), vec!["p1".to_string()]);

        store.remove("p1").await.expect("remove");
        store.remove("p1").await.expect("remove twice");
        assert!(matches!(
            store.load("p1").await,
            Err(MachineError::HostDoesNotExist(_))
        ));
    }

    #[tokio::test]
    async fn empty_and_corrupt_configs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MachineStore::new(MiniHome::new(dir.path()));
        let m = store.home().machine("empty");
        std::fs::create_dir_all(&m).expect("mkdir");
        std::fs::write(m.join("config.json"), "  \n").expect("write");
        assert!(matches!(store.load("empty").await, Err(MachineError::Empty { .. })));

        let m = store.home().machine("bad");
        std::fs::create_dir_all(&m).expect("mkdir");
        std::fs::write(m.join("config.json"), "{").expect("write");
        assert!(matches!(store.load("bad").await, Err(MachineError::Corrupt { .. })));
    }

    #[test]
    fn relocation_rewrites_paths() {
        let old = MiniHome::new("/old/.minikube");
        let new = MiniHome::new("/new/.minikube");
        let mut host = kic_host(&old);
        host.host_options.auth_options.server_cert_sans = vec!["localhost".to_string()];
        relocate(&mut host, &new);

        assert_eq!(host.raw_driver["StorePath"], "/new/.minikube");
        assert_eq!(host.raw_driver["NodeConfig"]["StorePath"], "/new/.minikube");
        assert_eq!(
            host.raw_driver["SSHKeyPath"],
            "/new/.minikube/machines/p1/id_rsa"
        );
        let auth = &host.host_options.auth_options;
        assert_eq!(auth.cert_dir, "/new/.minikube/certs");
        assert_eq!(auth.store_path, "/new/.minikube/machines/p1");
        assert_eq!(auth.server_cert_sans, vec!["localhost".to_string()]);
        assert_eq!(host.raw_driver["NodeConfig"]["ContainerName"], "p1");
    }

    #[test]
    fn field_names_are_stable() {
        let host = kic_host(&MiniHome::new("/h"));
        let v = serde_json::to_value(&host).expect("encode");
        assert!(v.get("RawDriver").is_some());
        assert!(v.get("DriverName").is_some());
        assert!(v["HostOptions"]["AuthOptions"].get("CertDir").is_some());
        assert!(v["HostOptions"]["EngineOptions"].get("TlsVerify").is_some());
        assert!(v["HostOptions"].get("SwarmOptions").is_some());
    }
}
