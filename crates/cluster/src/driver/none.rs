use std::net::UdpSocket;

use anyhow::Context;
use machine_rpc::MachineState;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BaseDriver, DriverCapability, DriverError, NONE};
use crate::command::{Cmd, ExecRunner, Runner};
use crate::config::{ClusterConfig, Node};
use crate::constants::vmpath;
use crate::reason;

/// Runs Kubernetes directly on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NoneDriver {
    #[serde(flatten)]
    pub base: BaseDriver,
    pub container_runtime: String,
}

impl NoneDriver {
    pub fn new(base: BaseDriver) -> Self {
        NoneDriver {
            base,
            container_runtime: String::new(),
        }
    }

    fn unsupported(operation: &'static str) -> anyhow::Error {
        DriverError::Unsupported {
            driver: NONE.to_string(),
            operation,
        }
        .into()
    }

    async fn systemctl(&self, verb: &str) -> anyhow::Result<()> {
        ExecRunner::new()
            .run(Cmd::sudo("systemctl").args([verb, "kubelet"]))
            .await?;
        Ok(())
    }
}

/// The address the host uses to reach the outside world.
pub fn outbound_ip() -> anyhow::Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding a probe socket")?;
    socket
        .connect("8.8.8.8:53")
        .context("no route to the outside world")?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[async_trait::async_trait]
impl DriverCapability for NoneDriver {
    fn driver_name(&self) -> String {
        NONE.to_string()
    }

    async fn pre_create_check(&mut self) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            if unsafe { libc::geteuid() } != 0 {
                return Err(reason::with_kind(
                    reason::DRV_NEEDS_ROOT,
                    anyhow::anyhow!("the 'none' driver must be run as the root user"),
                ));
            }
        }
        Ok(())
    }

    async fn create(&mut self, cc: &ClusterConfig, _node: &Node) -> anyhow::Result<()> {
        self.container_runtime = cc.container_runtime().to_string();
        self.base.ip_address = outbound_ip()?;
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        self.base.ip_address = outbound_ip()?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.systemctl("stop").await
    }

    async fn remove(&mut self) -> anyhow::Result<()> {
        let runner = ExecRunner::new();
        if let Err(e) = runner
            .run(Cmd::sudo("kubeadm").args(["reset", "--force"]))
            .await
        {
            debug!(error = %e, "kubeadm reset failed");
        }
        runner
            .run(Cmd::sudo("rm").args(["-rf", vmpath::GUEST_PERSISTENT_DIR]))
            .await?;
        Ok(())
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.systemctl("kill").await
    }

    async fn ip(&self) -> anyhow::Result<String> {
        if self.base.ip_address.is_empty() {
            outbound_ip()
        } else {
            Ok(self.base.ip_address.clone())
        }
    }

    async fn ssh_hostname(&self) -> anyhow::Result<String> {
        Err(Self::unsupported("ssh"))
    }

    async fn ssh_port(&self) -> anyhow::Result<u16> {
        Err(Self::unsupported("ssh"))
    }

    async fn ssh_key_path(&self) -> anyhow::Result<String> {
        Err(Self::unsupported("ssh"))
    }

    async fn ssh_username(&self) -> anyhow::Result<String> {
        Err(Self::unsupported("ssh"))
    }

    async fn state(&self) -> anyhow::Result<MachineState> {
        let active = ExecRunner::new()
            .run(Cmd::sudo("systemctl").args(["is-active", "--quiet", "kubelet"]))
            .await;
        Ok(if active.is_ok() {
            MachineState::Running
        } else {
            MachineState::Stopped
        })
    }

    async fn url(&self) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn config_raw(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()> {
        *self = serde_json::from_value(raw).context("decoding none driver config")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ssh_is_unsupported() {
        let d = NoneDriver::new(BaseDriver::new("minikube", "/root/.minikube"));
        let err = d.ssh_port().await.expect_err("no ssh");
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::Unsupported { .. })
        ));
        assert_eq!(d.url().await.expect("url"), "");
    }
}
