use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use machine_rpc::{Client, MachineState, Request};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{DriverCapability, Family};
use crate::config::{ClusterConfig, Node};
use crate::reason;

const CREATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// A driver running in a child process.
pub struct PluginDriver {
    name: String,
    client: Arc<Client>,
    // Killed when dropped.
    _child: Child,
    heartbeat: JoinHandle<()>,
}

impl Drop for PluginDriver {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Finds the executable serving `name`: a `docker-machine-driver-<name>`
/// binary on `PATH`, or this executable for drivers built in.
pub fn locate(name: &str) -> anyhow::Result<PathBuf> {
    let binary = format!("{}{}", machine_rpc::PLUGIN_BINARY_PREFIX, name);
    if let Ok(path) = which::which(&binary) {
        return Ok(path);
    }
    match super::lookup(name) {
        Some(def) if def.family != Family::Vm => {
            std::env::current_exe().context("locating the minikube executable")
        }
        _ => Err(reason::with_kind(
            reason::DRV_NOT_FOUND,
            anyhow::anyhow!("the {} driver requires {} on PATH", name, binary),
        )),
    }
}

impl PluginDriver {
    /// Starts the plugin for `name` and begins sending heartbeats.
    pub async fn spawn(name: &str) -> anyhow::Result<Self> {
        let path = locate(name)?;
        info!(driver = name, plugin = %path.display(), "starting driver plugin");
        let mut child = Command::new(&path)
            .env(machine_rpc::PLUGIN_ENV_KEY, machine_rpc::PLUGIN_ENV_VAL)
            .env(machine_rpc::PLUGIN_ENV_DRIVER_NAME, name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {}", path.display()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("plugin stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("plugin stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            let driver = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(driver = %driver, "{}", line);
                }
            });
        }

        let client = Arc::new(Client::new(stdout, stdin));
        let heartbeat = client.spawn_heartbeat(machine_rpc::HEARTBEAT_INTERVAL);
        let driver = PluginDriver {
            name: name.to_string(),
            client,
            _child: child,
            heartbeat,
        };
        let served: String = driver.call(Request::DriverName, QUERY_TIMEOUT).await?;
        if served != name {
            anyhow::bail!("plugin {} serves {:?}, not {:?}", path.display(), served, name);
        }
        Ok(driver)
    }

    async fn call<T: DeserializeOwned>(&self, request: Request, timeout: Duration) -> anyhow::Result<T> {
        let method = request.method();
        self.client
            .call(request, timeout)
            .await
            .with_context(|| format!("{} driver: {}", self.name, method))
    }

    async fn call_unit(&self, request: Request, timeout: Duration) -> anyhow::Result<()> {
        let method = request.method();
        self.client
            .call_unit(request, timeout)
            .await
            .with_context(|| format!("{} driver: {}", self.name, method))
    }
}

#[async_trait::async_trait]
impl DriverCapability for PluginDriver {
    fn driver_name(&self) -> String {
        self.name.clone()
    }

    async fn pre_create_check(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::PreCreateCheck, QUERY_TIMEOUT).await
    }

    async fn create(&mut self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()> {
        let request = Request::Create {
            config: serde_json::to_value(cc)?,
            node: serde_json::to_value(node)?,
        };
        self.call_unit(request, CREATE_TIMEOUT).await
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::Start, LIFECYCLE_TIMEOUT).await
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::Stop, LIFECYCLE_TIMEOUT).await
    }

    async fn restart(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::Restart, LIFECYCLE_TIMEOUT).await
    }

    async fn remove(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::Remove, LIFECYCLE_TIMEOUT).await
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.call_unit(Request::Kill, LIFECYCLE_TIMEOUT).await
    }

    async fn ip(&self) -> anyhow::Result<String> {
        self.call(Request::GetIp, QUERY_TIMEOUT).await
    }

    async fn ssh_hostname(&self) -> anyhow::Result<String> {
        self.call(Request::GetSshHostname, QUERY_TIMEOUT).await
    }

    async fn ssh_port(&self) -> anyhow::Result<u16> {
        self.call(Request::GetSshPort, QUERY_TIMEOUT).await
    }

    async fn ssh_key_path(&self) -> anyhow::Result<String> {
        self.call(Request::GetSshKeyPath, QUERY_TIMEOUT).await
    }

    async fn ssh_username(&self) -> anyhow::Result<String> {
        self.call(Request::GetSshUsername, QUERY_TIMEOUT).await
    }

    async fn state(&self) -> anyhow::Result<MachineState> {
        self.call(Request::GetState, QUERY_TIMEOUT).await
    }

    async fn url(&self) -> anyhow::Result<String> {
        self.call(Request::GetUrl, QUERY_TIMEOUT).await
    }

    async fn config_raw(&self) -> anyhow::Result<serde_json::Value> {
        self.call(Request::GetConfigRaw, QUERY_TIMEOUT).await
    }

    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()> {
        self.call_unit(Request::SetConfigRaw { config: raw }, QUERY_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vm_drivers_need_a_plugin_binary() {
        let err = locate("vfkit").expect_err("no plugin binary in the test environment");
        assert_eq!(reason::classify(&err, "linux").id, "DRV_NOT_FOUND");
    }

    #[test]
    fn built_in_drivers_are_served_by_this_executable() {
        let path = locate("ssh").expect("built in");
        assert_eq!(path, std::env::current_exe().expect("current exe"));
    }
}
