//! Waiting for a cluster to become healthy.
//!
//! `--wait` selects which checks run after the control plane starts. Each
//! check is polled with exponential backoff until the overall wait timeout.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod, ServiceAccount};
use kube::api::{Api, ListParams};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::backoff::{retry, ExponentialBackoffStrategy, RetryPolicy};
use crate::command::{Cmd, Runner};
use crate::reason;

pub const APISERVER: &str = "apiserver";
pub const SYSTEM_PODS: &str = "system_pods";
pub const DEFAULT_SA: &str = "default_sa";
pub const APPS_RUNNING: &str = "apps_running";
pub const NODE_READY: &str = "node_ready";
pub const KUBELET: &str = "kubelet";
pub const EXTRA: &str = "extra";

pub const ALL_COMPONENTS: [&str; 7] = [APISERVER, SYSTEM_PODS, DEFAULT_SA, APPS_RUNNING, NODE_READY, KUBELET, EXTRA];
pub const DEFAULT_COMPONENTS: [&str; 2] = [APISERVER, SYSTEM_PODS];

/// Component labels of the pods that must run for `apps_running`.
const EXPECTED_APPS: [&str; 6] = [
    "kube-dns",
    "etcd",
    "kube-apiserver",
    "kube-controller-manager",
    "kube-proxy",
    "kube-scheduler",
];

/// Parses a `--wait` value into the component map stored in the profile.
///
/// `all`/`true` select every component, `none`/`false` select none, and
/// anything else is a comma separated list of component names.
pub fn parse_wait(flag: &str) -> anyhow::Result<BTreeMap<String, bool>> {
    let selected: Vec<&str> = match flag.trim() {
        "" => DEFAULT_COMPONENTS.to_vec(),
        "all" | "true" => ALL_COMPONENTS.to_vec(),
        "none" | "false" => Vec::new(),
        list => {
            let mut out = Vec::new();
            for c in list.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if c == "all" || c == "none" {
                    return Err(reason::usage(format!("{:?} cannot be combined with other --wait values", c)));
                }
                if !ALL_COMPONENTS.contains(&c) {
                    return Err(reason::usage(format!(
                        "{:?} is not a valid --wait value, valid values are: all, none, {}",
                        c,
                        ALL_COMPONENTS.join(", ")
                    )));
                }
                out.push(c);
            }
            out
        }
    };
    Ok(ALL_COMPONENTS
        .iter()
        .map(|c| (c.to_string(), selected.contains(c)))
        .collect())
}

/// Where and how to reach the cluster being verified.
pub struct Target<'a> {
    pub runner: &'a dyn Runner,
    /// `https://host:port` of the apiserver as reachable from this host.
    pub server: String,
    pub ca_cert: PathBuf,
    /// A client for the profile's context, used by checks that query the API.
    pub client: Option<kube::Client>,
    pub node_name: String,
}

/// Runs the checks in `components` against `target` until they pass or
/// `timeout` elapses.
#[instrument(level = "info", skip(target), fields(server = %target.server))]
pub async fn wait_for(target: &Target<'_>, components: &[String], timeout: Duration) -> anyhow::Result<()> {
    let started = Instant::now();
    let wants = |c: &str| components.iter().any(|x| x == c);
    let left = || timeout.checked_sub(started.elapsed()).unwrap_or_default();

    if wants(APISERVER) {
        poll("apiserver process", left(), || apiserver_process(target.runner)).await?;
        poll("apiserver healthz", left(), || apiserver_healthz(&target.server, &target.ca_cert)).await?;
    }
    let needs_client = [SYSTEM_PODS, DEFAULT_SA, APPS_RUNNING, NODE_READY, EXTRA]
        .iter()
        .any(|c| wants(c));
    if needs_client {
        let client = target
            .client
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no Kubernetes client to verify the cluster with"))?;
        if wants(SYSTEM_PODS) {
            poll("system pods", left(), || system_pods(client.clone())).await?;
        }
        if wants(DEFAULT_SA) {
            poll("default service account", left(), || default_sa(client.clone())).await?;
        }
        if wants(APPS_RUNNING) {
            poll("apps running", left(), || apps_running(client.clone())).await?;
        }
        if wants(NODE_READY) {
            poll("node ready", left(), || node_ready(client.clone(), &target.node_name)).await?;
        }
        if wants(EXTRA) {
            poll("system-critical pods ready", left(), || system_critical_ready(client.clone())).await?;
        }
    }
    if wants(KUBELET) {
        poll("kubelet", left(), || kubelet(target.runner)).await?;
    }
    info!(elapsed = ?started.elapsed(), "cluster verified");
    Ok(())
}

/// Waits for the apiserver process to appear after a restart.
pub async fn wait_for_apiserver_process(runner: &dyn Runner, timeout: Duration) -> anyhow::Result<()> {
    poll("apiserver process", timeout, || apiserver_process(runner)).await
}

async fn poll<F, Fut>(what: &str, budget: Duration, op: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    debug!(%what, ?budget, "waiting");
    let mut backoff = ExponentialBackoffStrategy::new(Duration::from_millis(500), Duration::from_secs(5));
    retry(what, &mut backoff, RetryPolicy::deadline(budget), op)
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_START, e.context(format!("wait for {}", what))))
}

pub async fn apiserver_process(runner: &dyn Runner) -> anyhow::Result<()> {
    runner
        .run(Cmd::sudo("pgrep").args(["-xnf", "kube-apiserver.*minikube.*"]))
        .await
        .context("apiserver process never appeared")?;
    Ok(())
}

fn healthz_client(ca_cert: &Path) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(5));
    if let Ok(pem) = std::fs::read(ca_cert) {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

pub async fn apiserver_healthz(server: &str, ca_cert: &Path) -> anyhow::Result<()> {
    let url = format!("{}/healthz", server);
    let resp = healthz_client(ca_cert)?
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() || body.trim() != "ok" {
        anyhow::bail!("{} returned {}: {}", url, status, body.trim());
    }
    Ok(())
}

pub async fn system_pods(client: kube::Client) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, "kube-system");
    let list = pods.list(&ListParams::default()).await?;
    if list.items.len() < 2 {
        anyhow::bail!("only {} kube-system pods exist", list.items.len());
    }
    Ok(())
}

pub async fn default_sa(client: kube::Client) -> anyhow::Result<()> {
    let sas: Api<ServiceAccount> = Api::namespaced(client, "default");
    sas.get("default").await?;
    Ok(())
}

pub async fn apps_running(client: kube::Client) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, "kube-system");
    let list = pods.list(&ListParams::default()).await?;
    let mut found = std::collections::BTreeSet::new();
    for pod in list.items {
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map_or(false, |p| p == "Running");
        if !running {
            continue;
        }
        if let Some(labels) = pod.metadata.labels {
            for (k, v) in labels {
                if k == "component" || k == "k8s-app" {
                    found.insert(v);
                }
            }
        }
    }
    let missing: Vec<&str> = EXPECTED_APPS
        .iter()
        .copied()
        .filter(|a| !found.contains(*a))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("missing components: {}", missing.join(", "));
    }
    Ok(())
}

/// Waits for every system-critical kube-system pod to report `Ready`.
pub async fn system_critical_ready(client: kube::Client) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, "kube-system");
    let list = pods.list(&ListParams::default()).await?;
    let unready = unready_critical_pods(&list.items);
    if !unready.is_empty() {
        anyhow::bail!("system-critical pods not Ready: {}", unready.join(", "));
    }
    Ok(())
}

fn critical_component(pod: &Pod) -> Option<&str> {
    let labels = pod.metadata.labels.as_ref()?;
    ["component", "k8s-app"]
        .iter()
        .filter_map(|k| labels.get(*k))
        .map(String::as_str)
        .find(|v| EXPECTED_APPS.contains(v))
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Names of the system-critical pods that are not yet `Ready`. Components
/// with no pod at all are reported by their label.
fn unready_critical_pods(pods: &[Pod]) -> Vec<String> {
    let mut unready = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for pod in pods {
        if let Some(component) = critical_component(pod) {
            seen.insert(component.to_string());
            if !pod_ready(pod) {
                unready.push(pod.metadata.name.clone().unwrap_or_else(|| component.to_string()));
            }
        }
    }
    unready.extend(
        EXPECTED_APPS
            .iter()
            .filter(|a| !seen.contains(**a))
            .map(|a| a.to_string()),
    );
    unready
}

pub async fn node_ready(client: kube::Client, name: &str) -> anyhow::Result<()> {
    let nodes: Api<KubeNode> = Api::all(client);
    let node = nodes.get(name).await?;
    let ready = node
        .status
        .and_then(|s| s.conditions)
        .unwrap_or_default()
        .into_iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if !ready {
        anyhow::bail!("node {} is not Ready", name);
    }
    Ok(())
}

pub async fn kubelet(runner: &dyn Runner) -> anyhow::Result<()> {
    runner
        .run(Cmd::sudo("systemctl").args(["is-active", "--quiet", "service", "kubelet"]))
        .await
        .context("kubelet is not running")?;
    Ok(())
}

/// The kubelet state as shown by `status`.
pub async fn kubelet_status(runner: &dyn Runner) -> &'static str {
    let res = runner
        .run(Cmd::sudo("systemctl").args(["is-active", "kubelet"]))
        .await;
    match res {
        Ok(r) if r.stdout_str().trim() == "active" => "Running",
        _ => "Stopped",
    }
}

/// The apiserver state as shown by `status`.
pub async fn apiserver_status(runner: &dyn Runner, server: &str, ca_cert: &Path) -> &'static str {
    if apiserver_process(runner).await.is_err() {
        return "Stopped";
    }
    match apiserver_healthz(server, ca_cert).await {
        Ok(()) => "Running",
        Err(e) => {
            debug!(error = %e, "apiserver unhealthy");
            "Error"
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    fn selected(m: &BTreeMap<String, bool>) -> Vec<&str> {
        m.iter().filter(|(_, v)| **v).map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn wait_flag_values() {
        assert_eq!(selected(&parse_wait("all").expect("all")).len(), ALL_COMPONENTS.len());
        assert!(selected(&parse_wait("none").expect("none")).is_empty());
        assert_eq!(
            selected(&parse_wait("apiserver,kubelet,extra").expect("list")),
            vec!["apiserver", "extra", "kubelet"]
        );
        assert_eq!(selected(&parse_wait("true").expect("legacy")).len(), ALL_COMPONENTS.len());
        assert!(selected(&parse_wait("false").expect("legacy")).is_empty());
        assert_eq!(selected(&parse_wait("").expect("default")), vec!["apiserver", "system_pods"]);
        assert!(parse_wait("apiserver,bogus").is_err());
    }

    #[tokio::test]
    async fn kubelet_checks_use_systemctl() {
        let runner = FakeRunner::default().respond("is-active kubelet", "active\n", 0);
        assert_eq!(kubelet_status(&runner).await, "Running");
        let runner = FakeRunner::default().respond("is-active kubelet", "inactive\n", 3);
        assert_eq!(kubelet_status(&runner).await, "Stopped");
    }

    #[tokio::test]
    async fn stopped_apiserver_is_reported_without_probing() {
        let runner = FakeRunner::default().respond("pgrep", "", 1);
        let status = apiserver_status(&runner, "https://127.0.0.1:1", Path::new("/nonexistent")).await;
        assert_eq!(status, "Stopped");
    }

    fn pod(name: &str, component: &str, ready: bool) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "labels": { "component": component } },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }]
            }
        }))
        .expect("pod")
    }

    #[test]
    fn extra_waits_for_every_critical_pod_to_be_ready() {
        let mut pods: Vec<Pod> = EXPECTED_APPS
            .iter()
            .map(|a| pod(&format!("{}-minikube", a), a, true))
            .collect();
        assert!(unready_critical_pods(&pods).is_empty());

        pods[1] = pod("etcd-minikube", "etcd", false);
        pods.push(pod("storage-provisioner", "storage", false));
        assert_eq!(unready_critical_pods(&pods), vec!["etcd-minikube"]);

        pods.remove(0);
        assert_eq!(unready_critical_pods(&pods), vec!["etcd-minikube", "kube-dns"]);
    }

    #[tokio::test]
    async fn extra_wait_queries_the_cluster() {
        let runner = FakeRunner::default();
        let target = Target {
            runner: &runner,
            server: "https://127.0.0.1:1".to_string(),
            ca_cert: PathBuf::from("/nonexistent"),
            client: None,
            node_name: "minikube".to_string(),
        };
        let err = wait_for(&target, &[EXTRA.to_string()], Duration::from_secs(1))
            .await
            .expect_err("extra needs the API");
        assert!(format!("{:#}", err).contains("no Kubernetes client"), "{:#}", err);
    }

    #[tokio::test]
    async fn kubelet_only_wait_needs_no_client() {
        let runner = FakeRunner::default();
        let target = Target {
            runner: &runner,
            server: "https://127.0.0.1:1".to_string(),
            ca_cert: PathBuf::from("/nonexistent"),
            client: None,
            node_name: "minikube".to_string(),
        };
        wait_for(&target, &[KUBELET.to_string()], Duration::from_secs(1))
            .await
            .expect("kubelet active");
        assert!(runner.commands()[0].contains("systemctl is-active --quiet service kubelet"));
    }
}
