//! Host-side tunnels into a cluster.
//!
//! The LoadBalancer tunnel routes the service CIDR through the guest and
//! emulates a cloud load balancer by filling in the ingress of every
//! LoadBalancer Service. It runs until cancelled, then removes its route,
//! reverts the Services it touched and deregisters itself. Stale routes of
//! crashed tunnels are collected with [`cleanup_stale`].
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube_runtime::watcher::Event;
use machine_rpc::MachineState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_futures::Instrument;

use crate::driver::{Driver, DriverCapability};
use crate::handle::TaskHandle;
use crate::out::{Icon, Out};

pub mod patcher;
pub mod registry;
pub mod route;
pub mod ssh;

pub use patcher::{ServiceKey, ServicePatcher, StatusPatcher};
pub use registry::{Entry, Registry};
pub use route::{Route, Router};

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Reports the state of the machine a tunnel points at.
#[async_trait::async_trait]
pub trait HostProbe: Send + Sync {
    async fn state(&self) -> anyhow::Result<MachineState>;
}

#[async_trait::async_trait]
impl HostProbe for Driver {
    async fn state(&self) -> anyhow::Result<MachineState> {
        DriverCapability::state(self).await
    }
}

/// What the tunnel looked like at its last tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub machine_name: String,
    pub pid: u32,
    pub route: Option<Route>,
    pub machine_state: String,
    pub services: Vec<String>,
    pub machine_error: Option<String>,
    pub route_error: Option<String>,
    pub lb_error: Option<String>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let or_none = |e: &Option<String>| e.clone().unwrap_or_else(|| "no errors".to_string());
        writeln!(f, "Status:")?;
        writeln!(f, "\tmachine: {}", self.machine_name)?;
        writeln!(f, "\tpid: {}", self.pid)?;
        if let Some(route) = &self.route {
            writeln!(f, "\troute: {}", route)?;
        }
        writeln!(f, "\tminikube: {}", self.machine_state)?;
        writeln!(f, "\tservices: [{}]", self.services.join(", "))?;
        writeln!(f, "    errors: ")?;
        writeln!(f, "\t\tminikube: {}", or_none(&self.machine_error))?;
        writeln!(f, "\t\trouter: {}", or_none(&self.route_error))?;
        writeln!(f, "\t\tloadbalancer emulator: {}", or_none(&self.lb_error))
    }
}

/// The LoadBalancer tunnel of one cluster.
pub struct LoadBalancerTunnel {
    machine_name: String,
    route: Route,
    /// `None` when Services are reached over ssh instead of a route.
    router: Option<Router>,
    registry: Registry,
    probe: Box<dyn HostProbe>,
    patcher: Box<dyn ServicePatcher>,
    events: mpsc::Receiver<Event<Service>>,
    tick: Duration,
    out: Out,
    services: BTreeMap<ServiceKey, Service>,
    exposed: BTreeSet<ServiceKey>,
    route_active: bool,
    last: Option<Status>,
}

impl LoadBalancerTunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine_name: &str,
        route: Route,
        router: Option<Router>,
        registry: Registry,
        probe: Box<dyn HostProbe>,
        patcher: Box<dyn ServicePatcher>,
        events: mpsc::Receiver<Event<Service>>,
        out: Out,
    ) -> Self {
        LoadBalancerTunnel {
            machine_name: machine_name.to_string(),
            route,
            router,
            registry,
            probe,
            patcher,
            events,
            tick: DEFAULT_TICK,
            out,
            services: BTreeMap::new(),
            exposed: BTreeSet::new(),
            route_active: false,
            last: None,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Runs the tunnel on its own task.
    pub fn spawn(self, token: CancellationToken) -> TaskHandle {
        let span = tracing::info_span!("tunnel", machine = %self.machine_name);
        let task = tokio::spawn(self.run(token.clone()).instrument(span));
        TaskHandle::new(token, task)
    }

    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.tick);
        let mut watching = true;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let status = self.update().await;
                    if self.last.as_ref() != Some(&status) {
                        self.out.raw(&status.to_string());
                        self.last = Some(status);
                    }
                }
                event = self.events.recv(), if watching => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!("service watch ended");
                        watching = false;
                    }
                },
            }
        }
        self.cleanup().await
    }

    fn running(&self) -> bool {
        self.router.is_none() || self.route_active
    }

    async fn handle(&mut self, event: Event<Service>) {
        match event {
            Event::Applied(svc) => {
                let k = patcher::key(&svc);
                if patcher::is_load_balancer(&svc) {
                    self.services.insert(k, svc);
                } else {
                    self.services.remove(&k);
                    self.exposed.remove(&k);
                }
            }
            Event::Deleted(svc) => {
                let k = patcher::key(&svc);
                self.services.remove(&k);
                self.exposed.remove(&k);
            }
            Event::Restarted(list) => {
                self.services = list
                    .into_iter()
                    .filter(patcher::is_load_balancer)
                    .map(|svc| (patcher::key(&svc), svc))
                    .collect();
                let known = &self.services;
                self.exposed.retain(|k| known.contains_key(k));
            }
        }
        if self.running() {
            let _ = self.expose_all().await;
        }
    }

    async fn expose_all(&mut self) -> Option<String> {
        let mut errors = Vec::new();
        for (k, svc) in &self.services {
            match self.patcher.expose(svc).await {
                Ok(_) => {
                    self.exposed.insert(k.clone());
                }
                Err(e) => {
                    warn!(namespace = %k.0, service = %k.1, error = %e, "exposing service");
                    errors.push(format!("{}/{}: {}", k.0, k.1, e));
                }
            }
        }
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }

    async fn update(&mut self) -> Status {
        let mut status = Status {
            machine_name: self.machine_name.clone(),
            pid: std::process::id(),
            route: self.router.as_ref().map(|_| self.route.clone()),
            ..Default::default()
        };
        let state = match self.probe.state().await {
            Ok(s) => s,
            Err(e) => {
                status.machine_error = Some(e.to_string());
                MachineState::Error
            }
        };
        status.machine_state = state.to_string();

        if state != MachineState::Running {
            if self.route_active {
                info!(%state, "machine is not running, removing route");
                status.route_error = self.remove_route().await.err().map(|e| e.to_string());
            }
            return status;
        }

        if self.router.is_some() && !self.route_active {
            match self.add_route().await {
                Ok(()) => self.route_active = true,
                Err(e) => status.route_error = Some(e.to_string()),
            }
        }
        if self.running() {
            status.lb_error = self.expose_all().await;
        }
        status.services = self.exposed.iter().map(|(_, name)| name.clone()).collect();
        status
    }

    async fn add_route(&self) -> anyhow::Result<()> {
        if let Some(router) = &self.router {
            router.ensure(&self.route).await?;
            self.registry
                .register(Entry {
                    route: self.route.clone(),
                    machine_name: self.machine_name.clone(),
                    pid: std::process::id(),
                })
                .await?;
        }
        Ok(())
    }

    async fn remove_route(&mut self) -> anyhow::Result<()> {
        self.route_active = false;
        if let Some(router) = &self.router {
            router.cleanup(&self.route).await?;
            self.registry.remove(&self.route).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> anyhow::Result<()> {
        self.out.step(Icon::Stopping, "Stopping tunnel, cleaning up ...");
        let mut first_err = None;
        for k in std::mem::take(&mut self.exposed) {
            if let Err(e) = self.patcher.revert(&k).await {
                warn!(namespace = %k.0, service = %k.1, error = %e, "reverting service");
                first_err.get_or_insert(e);
            }
        }
        if self.route_active {
            if let Err(e) = self.remove_route().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Removes the routes of tunnels whose process is gone. Returns how many
/// were collected.
pub async fn cleanup_stale(registry: &Registry, router: &Router) -> anyhow::Result<usize> {
    let stale = registry.take_stale().await?;
    for entry in &stale {
        info!(route = %entry.route, machine = %entry.machine_name, pid = entry.pid, "removing stale route");
        router.cleanup(&entry.route).await?;
    }
    Ok(stale.len())
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::patcher::test::service;
    use super::*;
    use crate::command::fake::FakeRunner;
    use crate::localpath::MiniHome;
    use crate::out::Format;

    struct Up;

    #[async_trait::async_trait]
    impl HostProbe for Up {
        async fn state(&self) -> anyhow::Result<MachineState> {
            Ok(MachineState::Running)
        }
    }

    #[derive(Default, Clone)]
    struct Recorder {
        exposed: Arc<Mutex<Vec<String>>>,
        reverted: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl ServicePatcher for Recorder {
        async fn expose(&self, svc: &Service) -> anyhow::Result<bool> {
            let name = patcher::key(svc).1;
            let mut exposed = self.exposed.lock().expect("lock");
            if exposed.contains(&name) {
                return Ok(false);
            }
            exposed.push(name);
            Ok(true)
        }

        async fn revert(&self, key: &ServiceKey) -> anyhow::Result<()> {
            self.reverted.lock().expect("lock").push(key.1.clone());
            Ok(())
        }
    }

    fn route() -> Route {
        Route {
            gateway: "192.168.39.2".to_string(),
            dest_cidr: "10.96.0.0/12".to_string(),
        }
    }

    #[test]
    fn status_lists_errors() {
        let status = Status {
            machine_name: "minikube".to_string(),
            pid: 42,
            route: Some(route()),
            machine_state: "Running".to_string(),
            services: vec!["web".to_string()],
            route_error: Some("conflicting route".to_string()),
            ..Default::default()
        };
        let text = status.to_string();
        assert!(text.contains("\troute: 10.96.0.0/12 -> 192.168.39.2\n"));
        assert!(text.contains("\tservices: [web]\n"));
        assert!(text.contains("\t\trouter: conflicting route\n"));
        assert!(text.contains("\t\tminikube: no errors\n"));
    }

    #[tokio::test]
    async fn routes_services_then_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let runner = Arc::new(FakeRunner::default());
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(8);
        let tunnel = LoadBalancerTunnel::new(
            "minikube",
            route(),
            Some(Router::new("linux", runner.clone())),
            Registry::new(&home, 1000),
            Box::new(Up),
            Box::new(recorder.clone()),
            rx,
            Out::new(Format::Json),
        )
        .with_tick(Duration::from_millis(10));
        let mut handle = tunnel.spawn(CancellationToken::new());

        tx.send(Event::Applied(service("web", "LoadBalancer", "10.96.1.1", None)))
            .await
            .expect("send");
        tx.send(Event::Applied(service("db", "ClusterIP", "10.96.1.2", None)))
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let registry = Registry::new(&home, 1000);
        assert_eq!(registry.list().await.expect("list").len(), 1);
        assert!(runner
            .commands()
            .contains(&"sudo ip route add 10.96.0.0/12 via 192.168.39.2".to_string()));
        assert_eq!(*recorder.exposed.lock().expect("lock"), vec!["web".to_string()]);

        use crate::handle::StopHandler;
        handle.stop().await.expect("stop");
        handle.wait().await.expect("wait");
        assert_eq!(*recorder.reverted.lock().expect("lock"), vec!["web".to_string()]);
        assert!(registry.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn stale_routes_are_collected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new(&MiniHome::new(dir.path()), 1000);
        registry
            .register(Entry {
                route: route(),
                machine_name: "minikube".to_string(),
                pid: i32::MAX as u32 - 1,
            })
            .await
            .expect("register");
        let runner = Arc::new(FakeRunner::default().respond("ip route", "10.96.0.0/12 via 192.168.39.2 dev virbr1\n", 0));
        let router = Router::new("linux", runner.clone());
        assert_eq!(cleanup_stale(&registry, &router).await.expect("cleanup"), 1);
        assert!(runner
            .commands()
            .contains(&"sudo ip route delete 10.96.0.0/12".to_string()));
        assert!(registry.list().await.expect("list").is_empty());
    }
}
