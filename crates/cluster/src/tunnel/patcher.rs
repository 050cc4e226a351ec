//! Emulates a cloud load balancer by writing each LoadBalancer Service's
//! address into its status.
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube_runtime::watcher::{self, Event};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Namespace and name.
pub type ServiceKey = (String, String);

pub fn key(svc: &Service) -> ServiceKey {
    (
        svc.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
        svc.metadata.name.clone().unwrap_or_default(),
    )
}

pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map_or(false, |t| t == "LoadBalancer")
}

pub fn cluster_ip(svc: &Service) -> Option<&str> {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

pub fn ports(svc: &Service) -> Vec<u16> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().filter_map(|p| u16::try_from(p.port).ok()).collect())
        .unwrap_or_default()
}

fn ingress_ips(svc: &Service) -> Vec<&str> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.as_deref()).collect())
        .unwrap_or_default()
}

/// The ingress address `svc` needs, or `None` when it is not a
/// LoadBalancer or already carries `address`.
pub fn wanted_ingress<'a>(svc: &Service, address: Option<&'a str>) -> Option<&'a str> {
    if !is_load_balancer(svc) {
        return None;
    }
    let address = address?;
    if ingress_ips(svc) == [address] {
        None
    } else {
        Some(address)
    }
}

pub fn status_patch(ip: Option<&str>) -> serde_json::Value {
    let ingress = match ip {
        Some(ip) => json!([{ "ip": ip }]),
        None => json!([]),
    };
    json!({ "status": { "loadBalancer": { "ingress": ingress } } })
}

/// Applies the emulated load balancer to Services.
#[async_trait::async_trait]
pub trait ServicePatcher: Send + Sync {
    /// Makes `svc` reachable from the host. Returns whether anything changed.
    async fn expose(&self, svc: &Service) -> anyhow::Result<bool>;
    /// Undoes [`ServicePatcher::expose`].
    async fn revert(&self, key: &ServiceKey) -> anyhow::Result<()>;
}

/// Patches the status of Services to their ClusterIP, reachable from the
/// host through the tunnel's route.
pub struct StatusPatcher {
    client: kube::Client,
}

impl StatusPatcher {
    pub fn new(client: kube::Client) -> Self {
        StatusPatcher { client }
    }

    /// Writes `ip` (or nothing) as the ingress of a Service.
    pub async fn set_ingress(&self, key: &ServiceKey, ip: Option<&str>) -> anyhow::Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.0);
        api.patch_status(&key.1, &PatchParams::default(), &Patch::Merge(&status_patch(ip)))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServicePatcher for StatusPatcher {
    async fn expose(&self, svc: &Service) -> anyhow::Result<bool> {
        let ip = match wanted_ingress(svc, cluster_ip(svc)) {
            Some(ip) => ip,
            None => return Ok(false),
        };
        let k = key(svc);
        self.set_ingress(&k, Some(ip)).await?;
        info!(namespace = %k.0, service = %k.1, %ip, "patched load balancer ingress");
        Ok(true)
    }

    async fn revert(&self, key: &ServiceKey) -> anyhow::Result<()> {
        self.set_ingress(key, None).await?;
        debug!(namespace = %key.0, service = %key.1, "reverted load balancer ingress");
        Ok(())
    }
}

/// Forwards Service events into `tx` until the receiver goes away.
pub async fn watch_services(client: kube::Client, tx: mpsc::Sender<Event<Service>>) {
    let api: Api<Service> = Api::all(client);
    let mut events = watcher::watcher(api, ListParams::default()).boxed();
    loop {
        match events.try_next().await {
            Ok(Some(event)) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(?error, "error streaming service events");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec, ServiceStatus};

    pub(crate) fn service(name: &str, type_: &str, ip: &str, ingress: Option<&str>) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some("default".to_string());
        svc.spec = Some(ServiceSpec {
            type_: Some(type_.to_string()),
            cluster_ip: Some(ip.to_string()),
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        });
        if let Some(i) = ingress {
            svc.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(i.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
        }
        svc
    }

    #[test]
    fn only_unpatched_load_balancers_need_work() {
        let lb = service("web", "LoadBalancer", "10.96.12.4", None);
        assert_eq!(wanted_ingress(&lb, cluster_ip(&lb)), Some("10.96.12.4"));
        let done = service("web", "LoadBalancer", "10.96.12.4", Some("10.96.12.4"));
        assert_eq!(wanted_ingress(&done, cluster_ip(&done)), None);
        let plain = service("db", "ClusterIP", "10.96.12.5", None);
        assert_eq!(wanted_ingress(&plain, cluster_ip(&plain)), None);
        let headless = service("h", "LoadBalancer", "None", None);
        assert_eq!(cluster_ip(&headless), None);
        assert_eq!(ports(&lb), vec![80]);
        assert_eq!(key(&lb), ("default".to_string(), "web".to_string()));
    }

    #[test]
    fn patches_set_and_clear_ingress() {
        assert_eq!(
            status_patch(Some("10.96.12.4")),
            json!({"status": {"loadBalancer": {"ingress": [{"ip": "10.96.12.4"}]}}})
        );
        assert_eq!(
            status_patch(None),
            json!({"status": {"loadBalancer": {"ingress": []}}})
        );
    }
}
