//! Port forwards over ssh, used when the guest network is not routable from
//! the host (container drivers on macOS and Windows, remote daemons).
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use k8s_openapi::api::core::v1::Service;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_futures::Instrument;

use super::patcher::{self, ServiceKey, ServicePatcher, StatusPatcher};
use crate::command::SshClient;
use crate::handle::TaskHandle;
use crate::kubeconfig;

/// Asks the OS for an unused local port.
pub fn free_local_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).context("allocating a local port")?;
    Ok(listener.local_addr()?.port())
}

fn spawn(argv: &[String]) -> anyhow::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("starting {}", program))
}

/// Points the kubeconfig context `context` at `127.0.0.1:local_port` for as
/// long as the forwarding process `argv` runs.
///
/// The previous endpoint is written back when the token is cancelled or
/// the forward dies.
pub async fn api_server_tunnel(
    argv: Vec<String>,
    local_port: u16,
    kubeconfig_path: PathBuf,
    context: String,
    token: CancellationToken,
) -> anyhow::Result<TaskHandle> {
    let (orig_host, orig_port) = kubeconfig::endpoint(&kubeconfig_path, &context).await?;
    let mut child = spawn(&argv)?;
    kubeconfig::update_endpoint(&kubeconfig_path, &context, "127.0.0.1", local_port).await?;
    info!(%context, local_port, "api server tunnel started");

    let child_token = token.clone();
    let span = tracing::info_span!("api_server_tunnel", %context);
    let task = tokio::spawn(
        async move {
            tokio::select! {
                _ = child_token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "stopping ssh forward");
                    }
                }
                status = child.wait() => {
                    warn!(?status, "ssh forward exited");
                }
            }
            kubeconfig::update_endpoint(&kubeconfig_path, &context, &orig_host, orig_port)
                .await
                .context("restoring kubeconfig endpoint")?;
            info!("kubeconfig endpoint restored");
            Ok(())
        }
        .instrument(span),
    );
    Ok(TaskHandle::new(token, task))
}

/// argv forwarding every port of a Service from localhost through the node.
pub fn service_forward(ssh: &SshClient, cluster_ip: &str, ports: &[u16]) -> Vec<String> {
    let mut argv = vec!["ssh".to_string(), "-N".to_string()];
    for port in ports {
        argv.push("-L".to_string());
        argv.push(format!("127.0.0.1:{}:{}:{}", port, cluster_ip, port));
    }
    argv.push("-o".to_string());
    argv.push("ExitOnForwardFailure=yes".to_string());
    argv.extend(ssh.base_args());
    argv
}

/// Exposes LoadBalancer Services on `127.0.0.1` through one ssh forward per
/// Service.
pub struct SshServicePatcher {
    ssh: SshClient,
    status: StatusPatcher,
    forwards: Mutex<HashMap<ServiceKey, Child>>,
}

impl SshServicePatcher {
    pub fn new(ssh: SshClient, status: StatusPatcher) -> Self {
        SshServicePatcher {
            ssh,
            status,
            forwards: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl ServicePatcher for SshServicePatcher {
    async fn expose(&self, svc: &Service) -> anyhow::Result<bool> {
        let ip = match patcher::cluster_ip(svc) {
            Some(ip) if patcher::is_load_balancer(svc) => ip,
            _ => return Ok(false),
        };
        let k = patcher::key(svc);
        let mut forwards = self.forwards.lock().await;
        if forwards.contains_key(&k) {
            return Ok(false);
        }
        let ports = patcher::ports(svc);
        if ports.iter().any(|p| *p < 1024) {
            warn!(service = %k.1, ?ports, "privileged ports may require root to forward");
        }
        let child = spawn(&service_forward(&self.ssh, ip, &ports))?;
        forwards.insert(k.clone(), child);
        if patcher::wanted_ingress(svc, Some("127.0.0.1")).is_some() {
            self.status.set_ingress(&k, Some("127.0.0.1")).await?;
        }
        info!(namespace = %k.0, service = %k.1, ?ports, "forwarding service");
        Ok(true)
    }

    async fn revert(&self, key: &ServiceKey) -> anyhow::Result<()> {
        if let Some(mut child) = self.forwards.lock().await.remove(key) {
            let _ = child.kill().await;
        }
        self.status.set_ingress(key, None).await
    }
}
