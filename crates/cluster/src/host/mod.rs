//! Materializing nodes onto their driver.
//!
//! The host controller creates or repairs the machine behind a node, waits
//! until commands can run in it, and prepares it to run Kubernetes: TLS
//! material, the container runtime and the initial set of images.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use machine_rpc::MachineState;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry, ExponentialBackoffStrategy, RetryPolicy};
use crate::cache;
use crate::command::{Cmd, Runner};
use crate::config::{machine_name, ClusterConfig, Node};
use crate::constants;
use crate::cruntime::{self, Manager, RuntimeKind, RuntimeOptions};
use crate::driver::{self, BaseDriver, Driver, DriverCapability};
use crate::localpath::MiniHome;
use crate::machine::{self, Host, MachineError, MachineStore};
use crate::out::{Icon, Out};
use crate::reason;

pub mod certs;

/// How long a restarted machine may take to report an address.
const RESTART_IP_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_ATTEMPTS: usize = 3;

/// A machine that is up and reachable.
pub struct StartedHost {
    pub host: Host,
    pub driver: Driver,
    pub runner: Arc<dyn Runner>,
    pub ip: String,
    /// Whether the machine existed before this call.
    pub existed: bool,
}

/// Fails with `DRV_NOT_HEALTHY` when the driver for `name` is installed but
/// not working.
pub async fn ensure_driver_healthy(name: &str) -> anyhow::Result<()> {
    let def = driver::lookup(name).ok_or_else(|| {
        reason::with_kind(
            reason::DRV_NOT_FOUND,
            anyhow::anyhow!("The driver '{}' is not supported", name),
        )
    })?;
    let state = driver::status(def).await;
    if !state.installed {
        return Err(reason::with_kind(
            reason::DRV_NOT_FOUND,
            anyhow::anyhow!(
                "The '{}' driver is not installed: {}",
                name,
                state.error.unwrap_or_default()
            ),
        ));
    }
    if !state.healthy {
        return Err(reason::with_kind(
            reason::DRV_NOT_HEALTHY,
            anyhow::anyhow!(
                "The '{}' driver is not healthy: {}",
                name,
                state.error.unwrap_or_default()
            ),
        ));
    }
    Ok(())
}

/// Creates the machine for `node`, or starts it when it already exists.
#[instrument(level = "info", skip_all, fields(profile = %cc.name, node = %node.name))]
pub async fn start_host(home: &MiniHome, cc: &ClusterConfig, node: &Node, out: &Out) -> anyhow::Result<StartedHost> {
    ensure_driver_healthy(&cc.driver).await?;
    let store = MachineStore::new(home.clone());
    let name = machine_name(cc, node);

    let (host, driver, existed) = match store.load(&name).await {
        Ok(host) => {
            let driver = fix_host(&store, cc, node, &host, out).await?;
            (host, driver, true)
        }
        Err(MachineError::HostDoesNotExist(_)) => {
            let (host, driver) = create_host(&store, cc, node, out).await?;
            (host, driver, false)
        }
        Err(e) => return Err(reason::with_kind(reason::GUEST_LOAD_HOST, e)),
    };

    let runner = machine::command_runner(&driver, &name).await?;
    wait_for_commands(runner.as_ref(), cc.start_host_timeout).await?;
    let ip = driver.ip().await.context("getting machine IP")?;
    debug!(machine = %name, %ip, "machine is reachable");
    Ok(StartedHost {
        host,
        driver,
        runner,
        ip,
        existed,
    })
}

async fn create_host(store: &MachineStore, cc: &ClusterConfig, node: &Node, out: &Out) -> anyhow::Result<(Host, Driver)> {
    let name = machine_name(cc, node);
    let root = store.home().root().display().to_string();
    let mut d = Driver::new(&cc.driver, BaseDriver::new(&name, &root)).await?;
    let msg = if driver::is_kic(&cc.driver) {
        format!(
            "Creating {} container (CPUs={}, Memory={}MB) ...",
            cc.driver, cc.cpus, cc.memory
        )
    } else if driver::bare_metal(&cc.driver) {
        "Running on localhost ...".to_string()
    } else {
        format!(
            "Creating {} VM (CPUs={}, Memory={}MB, Disk={}MB) ...",
            cc.driver, cc.cpus, cc.memory, cc.disk_size
        )
    };
    out.step(Icon::Sparkle, msg);

    d.pre_create_check()
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_PROVISION, e))?;

    // Saved before Create so a half created machine can still be deleted.
    let mut host = Host::new(store.home(), &name, &cc.driver, d.config_raw().await?);
    store.save(&host).await?;

    tokio::time::timeout(cc.start_host_timeout, d.create(cc, node))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "creating host: create host timed out in {} seconds",
                cc.start_host_timeout.as_secs()
            )
        })?
        .context("creating host")?;

    host.raw_driver = d.config_raw().await?;
    store.save(&host).await?;
    info!(machine = %name, "created machine");
    Ok((host, d))
}

async fn fix_host(store: &MachineStore, cc: &ClusterConfig, node: &Node, host: &Host, out: &Out) -> anyhow::Result<Driver> {
    let mut d = host.driver().await?;
    let state = d.state().await.context("getting machine state")?;
    debug!(machine = %host.name, %state, "found existing machine");
    match state {
        MachineState::Running => {
            out.step(
                Icon::Running,
                format!("Updating the running {} \"{}\" ...", driver::full_name(&cc.driver), host.name),
            );
        }
        MachineState::None => {
            warn!(machine = %host.name, "machine config exists but the machine is gone, recreating");
            out.step(Icon::Sparkle, format!("Recreating \"{}\" ...", host.name));
            tokio::time::timeout(cc.start_host_timeout, d.create(cc, node))
                .await
                .map_err(|_| anyhow::anyhow!("recreating host timed out"))?
                .context("recreating host")?;
            let mut updated = host.clone();
            updated.raw_driver = d.config_raw().await?;
            store.save(&updated).await?;
        }
        _ => {
            out.step(
                Icon::Running,
                format!("Restarting existing {} for \"{}\" ...", driver::full_name(&cc.driver), host.name),
            );
            restart_stopped(&mut d).await.context("Error starting stopped host")?;
            let mut updated = host.clone();
            updated.raw_driver = d.config_raw().await?;
            store.save(&updated).await?;
        }
    }
    Ok(d)
}

async fn restart_stopped(d: &mut Driver) -> anyhow::Result<()> {
    d.start().await?;
    if driver::bare_metal(&d.driver_name()) {
        return Ok(());
    }
    let mut backoff = ExponentialBackoffStrategy::new(Duration::from_secs(1), Duration::from_secs(10));
    let d = &*d;
    retry("waiting for machine IP", &mut backoff, RetryPolicy::deadline(RESTART_IP_TIMEOUT), || async move {
        match d.ip().await {
            Ok(ip) if !ip.is_empty() => Ok(()),
            Ok(_) => anyhow::bail!("IP not found"),
            Err(e) => Err(e),
        }
    })
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "Machine didn't return an IP after {} seconds",
            RESTART_IP_TIMEOUT.as_secs()
        )
    })
}

/// Waits until a trivial command succeeds in the machine.
pub async fn wait_for_commands(runner: &dyn Runner, timeout: Duration) -> anyhow::Result<()> {
    let mut backoff = ExponentialBackoffStrategy::default();
    retry("waiting for SSH", &mut backoff, RetryPolicy::deadline(timeout), || {
        runner.run(Cmd::new("exit").arg("0"))
    })
    .await
    .map(|_| ())
    .map_err(|e| reason::with_kind(reason::GUEST_PROVISION, e))
}

/// Stops the machine named `name`. A machine that is already stopped is
/// left alone.
#[instrument(level = "info", skip(store))]
pub async fn stop_host(store: &MachineStore, name: &str) -> anyhow::Result<()> {
    let host = store
        .load(name)
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_LOAD_HOST, e))?;
    let mut d = host.driver().await?;
    if d.state().await? == MachineState::Stopped {
        info!(machine = name, "machine already stopped");
        return Ok(());
    }
    for attempt in 1..=STOP_ATTEMPTS {
        match d.stop().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < STOP_ATTEMPTS => {
                warn!(machine = name, attempt, error = %e, "stop failed, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(e) => return Err(reason::with_kind(reason::GUEST_STOP_TIMEOUT, e)),
        }
    }
    Ok(())
}

/// Removes the machine named `name` through its driver and deletes its
/// directory. A machine whose config is missing or unreadable only has its
/// directory removed.
#[instrument(level = "info", skip(store))]
pub async fn delete_host(store: &MachineStore, name: &str) -> anyhow::Result<()> {
    match store.load(name).await {
        Ok(host) => {
            let mut d = host.driver().await?;
            if let Err(e) = d.remove().await {
                warn!(machine = name, error = %e, "remove failed, killing instead");
                d.kill().await.context("killing machine")?;
                d.remove().await.context("removing machine")?;
            }
        }
        Err(MachineError::HostDoesNotExist(_)) => {
            debug!(machine = name, "machine config does not exist");
        }
        Err(e) => {
            warn!(machine = name, error = %e, "unable to load machine, removing its files only");
        }
    }
    store.remove(name).await
}

/// Installs and configures the requested container runtime.
#[instrument(level = "info", skip_all, fields(runtime = %cc.container_runtime()))]
pub async fn install_runtime(cc: &ClusterConfig, runner: Arc<dyn Runner>, out: &Out) -> anyhow::Result<Box<dyn Manager>> {
    let kind = RuntimeKind::from_name(cc.container_runtime()).ok_or_else(|| {
        reason::with_kind(
            reason::INTERNAL_NEW_RUNTIME,
            anyhow::anyhow!("unknown container runtime {:?}", cc.container_runtime()),
        )
    })?;
    let opts = RuntimeOptions::from_config(cc);
    let manager = cruntime::enable_runtime(kind, runner, &opts).await?;
    let version = manager.version().await.unwrap_or_default();
    out.step(
        Icon::Container,
        format!(
            "Preparing Kubernetes {} on {} {} ...",
            cc.kubernetes_config.kubernetes_version, kind, version
        ),
    );
    Ok(manager)
}

/// Puts the Kubernetes images into the guest runtime: from the preloaded
/// tarball when one is cached, and then every image of the user's cache
/// list. Images not handled here are pulled by kubeadm itself.
pub async fn prepare_images(home: &MiniHome, cc: &ClusterConfig, runner: &dyn Runner, manager: &dyn Manager) -> anyhow::Result<()> {
    let version = &cc.kubernetes_config.kubernetes_version;
    if cc.kubernetes_config.should_load_cached_images {
        match cache::preload::load(home, version, runner, manager).await {
            Ok(true) => {}
            Ok(false) => debug!(%version, "no preloaded images cached"),
            Err(e) => warn!(error = %e, "unable to load preloaded images, images will be pulled"),
        }
    }
    let images: Vec<String> = cache::images::cache_list(home).await?.into_iter().collect();
    if !images.is_empty() {
        cache::images::load_cached_images(home, runner, manager, &images).await?;
    }
    Ok(())
}

/// Chooses the image repository, probing mirrors for `country` when the
/// user did not name one.
pub async fn select_image_repository(cc: &ClusterConfig, out: &Out) -> String {
    let explicit = &cc.kubernetes_config.image_repository;
    if !explicit.is_empty() {
        return explicit.clone();
    }
    if cc.image_mirror_country.is_empty() {
        return String::new();
    }
    let candidates = repositories_for(&cc.image_mirror_country);
    for repo in &candidates {
        if repository_reachable(repo).await {
            info!(repository = %repo, "selected image repository");
            return repo.clone();
        }
    }
    let fallback = candidates.last().cloned().unwrap_or_default();
    out.warning(format!(
        "None of the known repositories in your location are accessible. Using {} as fallback.",
        fallback
    ));
    fallback
}

fn repositories_for(country: &str) -> Vec<String> {
    match country.to_ascii_lowercase().as_str() {
        "cn" => vec![
            constants::ALIYUN_MIRROR.to_string(),
            "registry.cn-hangzhou.aliyuncs.com/google_containers".to_string(),
        ],
        _ => vec!["registry.k8s.io".to_string()],
    }
}

async fn repository_reachable(repo: &str) -> bool {
    let registry = repo.split('/').next().unwrap_or(repo);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(format!("https://{}/v2/", registry)).send().await {
        // Registries answer 401 to anonymous catalog probes.
        Ok(resp) => resp.status().is_success() || resp.status() == reqwest::StatusCode::UNAUTHORIZED,
        Err(e) => {
            debug!(%registry, error = %e, "registry unreachable");
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[tokio::test]
    async fn waits_for_a_reachable_guest() {
        let runner = FakeRunner::default();
        wait_for_commands(&runner, Duration::from_secs(1)).await.expect("reachable");
        assert_eq!(runner.commands(), vec!["exit 0".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_guests_are_provisioning_failures() {
        let runner = FakeRunner::default().respond("exit", "", 255);
        let err = wait_for_commands(&runner, Duration::from_millis(10))
            .await
            .expect_err("unreachable");
        let kind = err
            .downcast_ref::<reason::ExitError>()
            .map(|e| e.kind.id)
            .expect("classified");
        assert_eq!(kind, "GUEST_PROVISION");
    }

    #[tokio::test]
    async fn deleting_a_missing_machine_removes_its_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let store = MachineStore::new(home.clone());
        let machine_dir = home.machine("minikube");
        tokio::fs::create_dir_all(&machine_dir).await.expect("mkdir");
        tokio::fs::write(machine_dir.join("config.json"), "").await.expect("empty config");

        delete_host(&store, "minikube").await.expect("delete");
        assert!(!machine_dir.exists());
        delete_host(&store, "minikube").await.expect("delete again");
    }

    #[tokio::test]
    async fn explicit_repository_wins() {
        let mut cc = ClusterConfig::new("minikube");
        cc.kubernetes_config.image_repository = "example.com/k8s".to_string();
        cc.image_mirror_country = "cn".to_string();
        assert_eq!(select_image_repository(&cc, &Out::default()).await, "example.com/k8s");
        cc.kubernetes_config.image_repository.clear();
        cc.image_mirror_country.clear();
        assert_eq!(select_image_repository(&cc, &Out::default()).await, "");
    }
}
