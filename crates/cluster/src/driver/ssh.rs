use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use machine_rpc::MachineState;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BaseDriver, DriverCapability, SSH};
use crate::command::{Cmd, Runner, SshClient, SshRunner};
use crate::config::{ClusterConfig, Node};
use crate::constants::DOCKER_DAEMON_PORT;

/// Uses an existing machine reachable over ssh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SshDriver {
    #[serde(flatten)]
    pub base: BaseDriver,
    /// The key the user supplied, before it is copied into the machine dir.
    pub ssh_key: String,
    pub engine_port: u16,
}

impl SshDriver {
    pub fn new(base: BaseDriver) -> Self {
        SshDriver {
            base,
            ssh_key: String::new(),
            engine_port: DOCKER_DAEMON_PORT,
        }
    }

    fn runner(&self) -> SshRunner {
        SshRunner::new(SshClient::new(
            self.base.ip_address.clone(),
            self.base.ssh_port,
            self.base.ssh_user.clone(),
            self.base.resolved_ssh_key_path(),
        ))
    }

    async fn install_key(&mut self) -> anyhow::Result<()> {
        if self.ssh_key.is_empty() {
            self.base.ssh_key_path = String::new();
            return Ok(());
        }
        let dst = self.base.machine_dir().join("id_rsa");
        tokio::fs::create_dir_all(self.base.machine_dir()).await?;
        tokio::fs::copy(Path::new(&self.ssh_key), &dst)
            .await
            .with_context(|| format!("copying ssh key {}", self.ssh_key))?;
        tokio::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o600)).await?;
        self.base.ssh_key_path = dst.display().to_string();
        Ok(())
    }
}

#[async_trait::async_trait]
impl DriverCapability for SshDriver {
    fn driver_name(&self) -> String {
        SSH.to_string()
    }

    async fn pre_create_check(&mut self) -> anyhow::Result<()> {
        if !self.ssh_key.is_empty() && !Path::new(&self.ssh_key).exists() {
            anyhow::bail!("ssh key {} does not exist", self.ssh_key);
        }
        Ok(())
    }

    async fn create(&mut self, cc: &ClusterConfig, _node: &Node) -> anyhow::Result<()> {
        if cc.ssh_ip_address.is_empty() {
            anyhow::bail!("the ssh driver requires --ssh-ip-address");
        }
        self.base.ip_address = cc.ssh_ip_address.clone();
        if !cc.ssh_user.is_empty() {
            self.base.ssh_user = cc.ssh_user.clone();
        }
        if cc.ssh_port != 0 {
            self.base.ssh_port = cc.ssh_port;
        }
        self.ssh_key = cc.ssh_key.clone();
        self.install_key().await?;
        self.runner()
            .run(Cmd::new("true"))
            .await
            .context("reaching the machine")?;
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.runner().run(Cmd::new("true")).await?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.runner()
            .run(Cmd::sudo("systemctl").args(["stop", "kubelet"]))
            .await?;
        Ok(())
    }

    async fn remove(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self
            .runner()
            .run(Cmd::sudo("kubeadm").args(["reset", "--force"]))
            .await
        {
            warn!(error = %e, "kubeadm reset failed on the remote machine");
        }
        Ok(())
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.stop().await
    }

    async fn ip(&self) -> anyhow::Result<String> {
        Ok(self.base.ip_address.clone())
    }

    async fn ssh_hostname(&self) -> anyhow::Result<String> {
        Ok(self.base.ip_address.clone())
    }

    async fn ssh_port(&self) -> anyhow::Result<u16> {
        Ok(self.base.ssh_port)
    }

    async fn ssh_key_path(&self) -> anyhow::Result<String> {
        Ok(self.base.ssh_key_path.clone())
    }

    async fn ssh_username(&self) -> anyhow::Result<String> {
        Ok(self.base.ssh_user.clone())
    }

    async fn state(&self) -> anyhow::Result<MachineState> {
        match self.runner().run(Cmd::new("true")).await {
            Ok(_) => Ok(MachineState::Running),
            Err(e) => {
                debug!(error = %e, "machine unreachable");
                Ok(MachineState::Error)
            }
        }
    }

    async fn url(&self) -> anyhow::Result<String> {
        Ok(format!(
            "tcp://{}:{}",
            crate::command::bracket_ipv6(&self.base.ip_address),
            self.engine_port
        ))
    }

    async fn config_raw(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()> {
        *self = serde_json::from_value(raw).context("decoding ssh driver config")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn create_requires_an_address() {
        let mut d = SshDriver::new(BaseDriver::new("remote", "/tmp/none"));
        let cc = ClusterConfig::new("remote");
        let node = Node::default();
        assert!(d.create(&cc, &node).await.is_err());
    }

    #[tokio::test]
    async fn urls() {
        let mut d = SshDriver::new(BaseDriver::new("remote", "/tmp/none"));
        d.base.ip_address = "fd00::5".to_string();
        assert_eq!(d.url().await.expect("url"), "tcp://[fd00::5]:2376");
    }
}
