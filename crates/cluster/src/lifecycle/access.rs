//! Commands that reach into a running cluster: `ip`, `ssh`, `cp`,
//! `kubectl`, `update-context`, `service --url` and `dashboard --url`.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::addons;
use crate::backoff::{retry, ExponentialBackoffStrategy, RetryPolicy};
use crate::cache;
use crate::command::cp::{CopyPlan, RemotePath};
use crate::command::{Asset, SshClient};
use crate::config::{machine_name, ClusterConfig, Settings};
use crate::constants;
use crate::driver::{self, DriverCapability};
use crate::kubeconfig;
use crate::out::Icon;
use crate::reason;
use crate::tunnel::ssh::free_local_port;

use super::{find_node, load_config, ClusterController, NodeHandle};

const DASHBOARD_NAMESPACE: &str = "kubernetes-dashboard";
const DASHBOARD_SERVICE: &str = "kubernetes-dashboard";

/// The IP of `node`, or of the primary control plane.
pub async fn ip(settings: &Settings, node: &str) -> anyhow::Result<String> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let node = find_node(&cc, node)?;
    let handle = NodeHandle::load(&settings.home, &cc, &node).await?;
    handle
        .driver
        .ip()
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_STATUS, e.context("getting IP")))
}

/// The ssh client for a loaded node.
pub async fn ssh_client(handle: &NodeHandle) -> anyhow::Result<SshClient> {
    let d = &handle.driver;
    Ok(SshClient::new(
        d.ssh_hostname().await?,
        d.ssh_port().await?,
        d.ssh_username().await?,
        d.ssh_key_path().await?,
    ))
}

/// argv for `minikube ssh`: an interactive shell on `node`, or `command`.
pub async fn ssh_argv(settings: &Settings, node: &str, command: &[String]) -> anyhow::Result<Vec<String>> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    if driver::bare_metal(&cc.driver) {
        return Err(reason::usage(format!(
            "'{}' driver does not support 'minikube ssh' command",
            cc.driver
        )));
    }
    let node = find_node(&cc, node)?;
    let handle = NodeHandle::load(&settings.home, &cc, &node).await?;
    let client = ssh_client(&handle).await?;
    let remote = command.join(" ");
    Ok(client.command(if remote.is_empty() { None } else { Some(&remote) }))
}

fn split_dir(path: &str) -> (String, String) {
    let p = Path::new(path);
    let dir = p
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "/".to_string());
    let name = p
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, name)
}

async fn read_remote(settings: &Settings, cc: &ClusterConfig, from: &RemotePath) -> anyhow::Result<(Vec<u8>, String)> {
    let node = find_node(cc, &from.node)?;
    let handle = NodeHandle::load(&settings.home, cc, &node).await?;
    let mut file = handle.runner.readable_file(&from.path).await?;
    let mut data = Vec::with_capacity(file.length as usize);
    file.reader.read_to_end(&mut data).await?;
    Ok((data, file.permissions))
}

/// `minikube cp`: copies between the host and nodes, or between nodes.
pub async fn copy(settings: &Settings, src: &str, dst: &str) -> anyhow::Result<CopyPlan> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let primary = cc
        .primary_control_plane()
        .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e))?;
    let plan = CopyPlan::new(src, dst, &machine_name(&cc, &primary))?;
    debug!(?plan, "copying");
    let (dir, name) = split_dir(&plan.dst.path);

    match (plan.src.node.is_empty(), plan.dst.node.is_empty()) {
        (true, false) => {
            let node = find_node(&cc, &plan.dst.node)?;
            let handle = NodeHandle::load(&settings.home, &cc, &node).await?;
            let local = PathBuf::from(&plan.src.path);
            if !local.is_file() {
                return Err(reason::usage(format!("{} is not a file", local.display())));
            }
            handle
                .runner
                .copy(&Asset::file(local, dir, name, "0644"))
                .await?;
        }
        (false, true) => {
            let (data, _) = read_remote(settings, &cc, &plan.src).await?;
            tokio::fs::write(&plan.dst.path, data)
                .await
                .with_context(|| format!("writing {}", plan.dst.path))?;
        }
        (false, false) => {
            let (data, permissions) = read_remote(settings, &cc, &plan.src).await?;
            let node = find_node(&cc, &plan.dst.node)?;
            let handle = NodeHandle::load(&settings.home, &cc, &node).await?;
            handle
                .runner
                .copy(&Asset::memory(data, dir, name, permissions))
                .await?;
        }
        (true, true) => {
            return Err(reason::usage("at least one side of the copy must name a node"));
        }
    }
    Ok(plan)
}

/// argv running the cached kubectl that matches the cluster's version
/// against the profile's context.
pub async fn kubectl(settings: &Settings, args: &[String]) -> anyhow::Result<Vec<String>> {
    let version = match settings.store().load(&settings.profile).await {
        Ok(cc) => cc.kubernetes_config.kubernetes_version,
        Err(e) => {
            debug!(error = %e, "no profile config, using the default kubectl");
            constants::DEFAULT_KUBERNETES_VERSION.to_string()
        }
    };
    let path = cache::cache_binary(&settings.home, &version, "kubectl")
        .await
        .map_err(|e| reason::with_kind(reason::INET_CACHE_KUBECTL, e))?;
    let mut argv = vec![path.display().to_string(), format!("--context={}", settings.profile)];
    argv.extend(args.iter().cloned());
    Ok(argv)
}

/// `minikube update-context`. Returns whether the kubeconfig changed.
pub async fn update_context(settings: &Settings) -> anyhow::Result<bool> {
    let out = settings.out();
    let ctl = ClusterController::load(settings).await?;
    let changed = kubeconfig::update_endpoint(&settings.kubeconfig, ctl.profile(), &ctl.cp.hostname, ctl.cp.port)
        .await
        .map_err(|e| reason::with_kind(reason::HOST_KUBECONFIG_UPDATE, e))?;
    if changed {
        out.step(
            Icon::Celebrate,
            format!(
                "\"{}\" context has been updated to point to {}:{}",
                ctl.profile(),
                ctl.cp.hostname,
                ctl.cp.port
            ),
        );
    } else {
        out.step(
            Icon::Check,
            format!("No changes required for the \"{}\" context", ctl.profile()),
        );
    }
    kubeconfig::set_current_context(&settings.kubeconfig, ctl.profile())
        .await
        .map_err(|e| reason::with_kind(reason::HOST_KUBECONFIG_UPDATE, e))?;
    out.step(Icon::Check, format!("Current context is \"{}\"", ctl.profile()));
    Ok(changed)
}

/// Service URLs plus whatever keeps them reachable.
pub struct ServiceUrls {
    pub urls: Vec<String>,
    /// ssh forwards, killed when dropped.
    pub forwards: Vec<Child>,
}

/// The node ports of `svc` by port name.
pub fn node_ports(svc: &Service) -> Vec<u16> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p.node_port)
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn service_url(host: &str, port: u16, https: bool) -> String {
    let scheme = if https { "https" } else { "http" };
    format!("{}://{}:{}", scheme, crate::command::bracket_ipv6(host), port)
}

fn spawn_detached(argv: &[String]) -> anyhow::Result<Child> {
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

/// `minikube service --url`.
///
/// Drivers whose node network is not reachable from the host get an ssh
/// forward per Service port to its ClusterIP; the URLs then point at
/// `127.0.0.1` and stay valid as long as the forwards live.
pub async fn service_urls(settings: &Settings, namespace: &str, name: &str, https: bool) -> anyhow::Result<ServiceUrls> {
    let ctl = ClusterController::load(settings).await?;
    let client = kubeconfig::client(&settings.kubeconfig, ctl.profile())
        .await
        .map_err(|e| reason::with_kind(reason::SVC_LIST, e))?;
    let api: Api<Service> = Api::namespaced(client, namespace);
    let svc = match api.get(name).await {
        Ok(s) => s,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(reason::with_kind(
                reason::SVC_NOT_FOUND,
                anyhow::anyhow!("Service '{}' was not found in '{}' namespace", name, namespace),
            ))
        }
        Err(e) => return Err(reason::with_kind(reason::SVC_LIST, e)),
    };

    if !driver::needs_port_forward(&ctl.config.driver) {
        let ports = node_ports(&svc);
        if ports.is_empty() {
            return Err(reason::with_kind(
                reason::SVC_NOT_FOUND,
                anyhow::anyhow!("service {}/{} has no node port", namespace, name),
            ));
        }
        let urls = ports
            .into_iter()
            .map(|p| service_url(&ctl.cp.ip, p, https))
            .collect();
        return Ok(ServiceUrls {
            urls,
            forwards: Vec::new(),
        });
    }

    let cluster_ip = crate::tunnel::patcher::cluster_ip(&svc)
        .ok_or_else(|| reason::with_kind(reason::SVC_NOT_FOUND, anyhow::anyhow!("service {}/{} has no ClusterIP", namespace, name)))?
        .to_string();
    let ssh = ssh_client(&ctl.cp.handle).await?;
    let mut urls = Vec::new();
    let mut forwards = Vec::new();
    for port in crate::tunnel::patcher::ports(&svc) {
        let local = free_local_port()?;
        forwards.push(
            spawn_detached(&ssh.forward(local, &cluster_ip, port))
                .map_err(|e| reason::with_kind(reason::SVC_TUNNEL_START, e))?,
        );
        urls.push(service_url("127.0.0.1", local, https));
    }
    info!(service = %name, count = urls.len(), "service forwarded over ssh");
    Ok(ServiceUrls { urls, forwards })
}

/// The dashboard URL served by `kubectl proxy` on `port`.
pub fn dashboard_url(port: u16) -> String {
    format!(
        "http://127.0.0.1:{}/api/v1/namespaces/{}/services/http:{}:/proxy/",
        port, DASHBOARD_NAMESPACE, DASHBOARD_SERVICE
    )
}

/// `minikube dashboard --url`: starts `kubectl proxy` and waits until the
/// dashboard answers through it. The proxy lives as long as the returned
/// child.
pub async fn dashboard(settings: &Settings, port: u16) -> anyhow::Result<(String, Child)> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    if !cc.addon_enabled(addons::DASHBOARD) {
        return Err(reason::with_kind(
            reason::ADDON_NOT_ENABLED,
            anyhow::anyhow!(
                "The dashboard addon is not enabled. To enable it run: minikube addons enable dashboard -p {}",
                cc.name
            ),
        ));
    }
    let port = if port == 0 { free_local_port()? } else { port };
    let argv = kubectl(settings, &["proxy".to_string(), format!("--port={}", port)]).await?;
    let proxy = spawn_detached(&argv).map_err(|e| reason::with_kind(reason::SVC_TUNNEL_START, e))?;
    let url = dashboard_url(port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let mut backoff = ExponentialBackoffStrategy::new(Duration::from_millis(500), Duration::from_secs(5));
    retry("dashboard", &mut backoff, RetryPolicy::deadline(constants::DEFAULT_WAIT_TIMEOUT), || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let resp = client.get(&url).send().await?;
            anyhow::ensure!(resp.status().is_success(), "{} returned {}", url, resp.status());
            Ok(())
        }
    })
    .await
    .map_err(|e| reason::with_kind(reason::SVC_TIMEOUT, e))?;
    Ok((url, proxy))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;
    use crate::localpath::MiniHome;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn settings(dir: &Path) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir.join(".minikube")));
        s.kubeconfig = dir.join("kubeconfig");
        s.output = crate::out::Format::Json;
        s
    }

    #[test]
    fn node_ports_and_urls() {
        let svc = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        port: 80,
                        node_port: Some(30080),
                        ..Default::default()
                    },
                    ServicePort {
                        port: 443,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_ports(&svc), vec![30080]);
        assert_eq!(service_url("192.168.49.2", 30080, false), "http://192.168.49.2:30080");
        assert_eq!(service_url("fd00::2", 443, true), "https://[fd00::2]:443");
    }

    #[test]
    fn dashboard_urls_go_through_the_proxy() {
        assert_eq!(
            dashboard_url(8001),
            "http://127.0.0.1:8001/api/v1/namespaces/kubernetes-dashboard/services/http:kubernetes-dashboard:/proxy/"
        );
    }

    #[test]
    fn destinations_split_into_dir_and_name() {
        assert_eq!(split_dir("/home/docker/a.txt"), ("/home/docker".to_string(), "a.txt".to_string()));
        assert_eq!(split_dir("/a.txt"), ("/".to_string(), "a.txt".to_string()));
    }

    #[tokio::test]
    async fn ssh_is_refused_for_the_none_driver() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let cc = cluster("minikube", "none", 0);
        settings.store().save("minikube", &cc).await.expect("save");
        let err = ssh_argv(&settings, "", &[]).await.expect_err("none");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));
    }

    #[tokio::test]
    async fn dashboard_needs_the_addon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let cc = cluster("minikube", "docker", 0);
        settings.store().save("minikube", &cc).await.expect("save");
        let err = dashboard(&settings, 0).await.expect_err("disabled");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("SVC_ADDON_NOT_ENABLED"));
    }

    #[tokio::test]
    async fn copies_need_a_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let err = copy(&settings, "a.txt", "/home/docker/").await.expect_err("missing");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("GUEST_NOT_FOUND"));
    }
}
