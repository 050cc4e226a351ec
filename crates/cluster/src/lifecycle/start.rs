//! `minikube start`: the bring-up pipeline.
//!
//! ```text
//! load or create config -> validate -> resolve driver -> size resources
//!   -> lock profile -> cache artifacts -> create/start host -> runtime
//!   -> bootstrap or restart -> verify -> addons -> kubeconfig -> banner
//! ```
//!
//! Stages between the host and the verification may be retried once from a
//! fresh machine when `--delete-on-failure` is set.
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::addons;
use crate::bootstrapper::{self, extra, verify, versions, Bootstrapper};
use crate::cache;
use crate::config::{self, machine_name, ClusterConfig, ConfigError, Node, Settings};
use crate::constants;
use crate::cruntime::RuntimeKind;
use crate::driver;
use crate::host;
use crate::machine::MachineStore;
use crate::out::{Icon, Out};
use crate::reason;

use super::{api_endpoint, connect, PROFILE_LOCK_TIMEOUT};

/// Flags of `minikube start`. `None` and empty values keep what an existing
/// profile has.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    pub driver: String,
    pub kubernetes_version: String,
    pub container_runtime: String,
    pub memory: Option<String>,
    pub cpus: Option<u32>,
    pub disk_size: Option<String>,
    /// Total nodes to run. Zero keeps the current topology.
    pub nodes: usize,
    pub ha: bool,
    pub wait: Option<String>,
    pub wait_timeout: Option<Duration>,
    pub addons: Vec<String>,
    pub extra_config: Vec<String>,
    pub feature_gates: String,
    pub image_repository: String,
    pub image_mirror_country: String,
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
    pub docker_env: Vec<String>,
    pub docker_opt: Vec<String>,
    pub apiserver_port: Option<u16>,
    pub apiserver_names: Vec<String>,
    pub service_cidr: String,
    pub network: String,
    pub keep_context: bool,
    pub embed_certs: bool,
    pub mount: bool,
    pub mount_string: String,
    pub cache_images: bool,
    pub download_only: bool,
    pub delete_on_failure: bool,
    pub force: bool,
}

/// Builds the config to start from the existing one, if any, and the flags.
pub fn generate_config(name: &str, existing: Option<&ClusterConfig>, opts: &StartOptions, driver_name: &str) -> anyhow::Result<(ClusterConfig, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut cc = existing.cloned().unwrap_or_else(|| ClusterConfig::new(name));
    cc.upgrade(name);
    cc.driver = driver_name.to_string();

    let old_version = existing.map(|e| e.kubernetes_config.kubernetes_version.clone());
    let version = if !opts.kubernetes_version.is_empty() {
        match opts.kubernetes_version.as_str() {
            "stable" => constants::DEFAULT_KUBERNETES_VERSION.to_string(),
            "latest" => constants::NEWEST_KUBERNETES_VERSION.to_string(),
            v if v.starts_with('v') => v.to_string(),
            v => format!("v{}", v),
        }
    } else {
        old_version
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| constants::DEFAULT_KUBERNETES_VERSION.to_string())
    };
    warnings.extend(versions::check(name, old_version.as_deref(), &version, opts.force)?);
    cc.kubernetes_config.kubernetes_version = version.clone();

    if !opts.container_runtime.is_empty() {
        if RuntimeKind::from_name(&opts.container_runtime).is_none() {
            return Err(reason::usage(format!(
                "invalid container runtime {:?}, valid values are: docker, containerd, cri-o",
                opts.container_runtime
            )));
        }
        if let Some(old) = existing.map(|e| e.container_runtime()) {
            if RuntimeKind::from_name(old) != RuntimeKind::from_name(&opts.container_runtime) {
                return Err(reason::with_kind(
                    reason::GUEST_DRIVER_MISMATCH,
                    anyhow::anyhow!(
                        "the existing cluster uses the {} runtime; delete it to switch to {}",
                        old,
                        opts.container_runtime
                    ),
                ));
            }
        }
        cc.kubernetes_config.container_runtime = opts.container_runtime.clone();
    }

    if let Some(cpus) = opts.cpus {
        cc.cpus = cpus;
    }
    if let Some(disk) = &opts.disk_size {
        cc.disk_size = config::parse_size_mib(disk).map_err(reason::usage)?;
    }
    let nodes = requested_nodes(existing, opts)?;
    if nodes > 1 && !driver::allows_multi_node(driver_name) {
        return Err(reason::with_kind(
            reason::DRV_UNSUPPORTED_MULTINODE,
            anyhow::anyhow!("The {} driver does not support multi-node clusters", driver_name),
        ));
    }
    match &opts.memory {
        Some(m) => cc.memory = config::parse_size_mib(m).map_err(reason::usage)?,
        None if existing.is_none() => {
            cc.memory = config::suggest_memory_mib(config::host_memory_mib(), 0, nodes);
        }
        None => {}
    }
    if cc.memory < 1800 && !driver::bare_metal(driver_name) {
        warnings.push(format!(
            "The requested memory allocation of {}MiB is below the usable minimum of 1800MiB",
            cc.memory
        ));
    }

    if let Some(wait) = &opts.wait {
        cc.verify_components = verify::parse_wait(wait)?;
    } else if cc.verify_components.is_empty() {
        cc.verify_components = verify::parse_wait("")?;
    }
    if !opts.extra_config.is_empty() {
        let parsed = opts
            .extra_config
            .iter()
            .map(|s| extra::parse(s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        extra::validate(&parsed)?;
        cc.kubernetes_config.extra_options = parsed;
    }
    if !opts.feature_gates.is_empty() {
        cc.kubernetes_config.feature_gates = opts.feature_gates.clone();
    }
    if !opts.image_repository.is_empty() {
        cc.kubernetes_config.image_repository = opts.image_repository.clone();
    }
    if !opts.image_mirror_country.is_empty() {
        cc.image_mirror_country = opts.image_mirror_country.clone();
    }
    if !opts.service_cidr.is_empty() {
        cc.kubernetes_config.service_cidr = opts.service_cidr.clone();
    }
    if !opts.network.is_empty() {
        cc.network = opts.network.clone();
    }
    if let Some(port) = opts.apiserver_port {
        cc.api_server_port = port;
    }
    extend_unique(&mut cc.kubernetes_config.api_server_names, &opts.apiserver_names);
    extend_unique(&mut cc.insecure_registry, &opts.insecure_registry);
    extend_unique(&mut cc.registry_mirror, &opts.registry_mirror);
    extend_unique(&mut cc.docker_env, &opts.docker_env);
    extend_unique(&mut cc.docker_opt, &opts.docker_opt);
    cc.keep_context = opts.keep_context;
    cc.embed_certs = opts.embed_certs;
    cc.kubernetes_config.should_load_cached_images = opts.cache_images;
    if opts.mount || !opts.mount_string.is_empty() {
        cc.mount = true;
        if !opts.mount_string.is_empty() {
            cc.mount_string = opts.mount_string.clone();
        }
    }

    if cc.nodes.is_empty() {
        cc.nodes.push(Node {
            name: String::new(),
            port: cc.api_server_port,
            control_plane: true,
            worker: true,
            ..Default::default()
        });
    }
    let runtime = cc.container_runtime().to_string();
    for n in &mut cc.nodes {
        n.kubernetes_version = version.clone();
        n.container_runtime = runtime.clone();
    }
    let control_planes = if opts.ha { 3 } else { 1 };
    while cc.nodes.len() < nodes {
        let cp = cc.control_planes().count() < control_planes;
        let node = Node {
            name: cc.next_node_name(),
            kubernetes_version: version.clone(),
            container_runtime: runtime.clone(),
            control_plane: cp,
            worker: true,
            port: if cp { cc.api_server_port } else { 0 },
            ..Default::default()
        };
        cc.nodes.push(node);
    }
    Ok((cc, warnings))
}

fn extend_unique(into: &mut Vec<String>, values: &[String]) {
    for v in values {
        if !into.contains(v) {
            into.push(v.clone());
        }
    }
}

fn requested_nodes(existing: Option<&ClusterConfig>, opts: &StartOptions) -> anyhow::Result<usize> {
    let current = existing.map_or(0, |e| e.nodes.len());
    let mut nodes = opts.nodes;
    if opts.ha {
        if nodes == 0 || nodes < 3 {
            nodes = 3;
        }
    }
    if existing.is_some() && nodes != 0 && nodes != current {
        return Err(reason::usage(
            "You cannot change the number of nodes for an existing cluster. Use 'minikube node add' to add nodes to an existing cluster.",
        ));
    }
    if existing.is_some() && opts.ha && !existing.map_or(false, |e| e.is_ha()) {
        return Err(reason::usage(
            "An existing single control plane cluster cannot be converted to a highly available cluster",
        ));
    }
    Ok(nodes.max(current).max(1))
}

/// Runs the whole bring-up for the profile in `settings`.
#[instrument(level = "info", skip_all, fields(profile = %settings.profile))]
pub async fn start(settings: &Settings, opts: &StartOptions) -> anyhow::Result<ClusterConfig> {
    let out = settings.out();
    let store = settings.store();
    let name = settings.profile.as_str();
    config::validate_profile_name(name)?;

    let existing = match store.load(name).await {
        Ok(cc) => Some(cc),
        Err(ConfigError::NotFound(_)) => None,
        Err(e) => return Err(reason::with_kind(reason::HOST_CONFIG_LOAD, e)),
    };
    let os = reason::host_os();
    let driver_name = driver::resolve(&opts.driver, existing.as_ref().map(|e| e.driver.as_str()), os).await?;
    let (mut cc, warnings) = generate_config(name, existing.as_ref(), opts, &driver_name)?;
    out.step(
        Icon::Happy,
        format!(
            "minikube on {} using the {} driver {}",
            os,
            driver_name,
            if existing.is_some() { "based on existing profile" } else { "based on user configuration" }
        ),
    );
    for w in warnings {
        out.warning(w);
    }
    if cc.kubernetes_config.image_repository.is_empty() && !cc.image_mirror_country.is_empty() {
        cc.kubernetes_config.image_repository = host::select_image_repository(&cc, &out).await;
    }

    let _lock = store.lock(name, PROFILE_LOCK_TIMEOUT).await?;
    cache_artifacts(settings, &cc, &out).await?;
    if opts.download_only {
        out.step(Icon::Check, "Download complete!");
        return Ok(cc);
    }
    store
        .save(name, &cc)
        .await
        .map_err(|e| reason::with_kind(reason::HOST_SAVE_PROFILE, e))?;

    let wait_timeout = opts.wait_timeout.unwrap_or(constants::DEFAULT_WAIT_TIMEOUT);
    let primary = cc
        .primary_control_plane()
        .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e))?;
    let (endpoint, bs) = match start_primary(settings, &mut cc, &primary, wait_timeout, &out).await {
        Ok(r) => r,
        Err(e) if opts.delete_on_failure => {
            out.warning(format!("Failed to start node {}, deleting it and trying again: {:#}", machine_name(&cc, &primary), e));
            let machines = MachineStore::new(settings.home.clone());
            host::delete_host(&machines, &machine_name(&cc, &primary)).await?;
            start_primary(settings, &mut cc, &primary, wait_timeout, &out)
                .await
                .map_err(guest_start)?
        }
        Err(e) => return Err(guest_start(e)),
    };

    let secondary: Vec<Node> = cc
        .nodes
        .iter()
        .filter(|n| n.name != primary.name)
        .cloned()
        .collect();
    for node in secondary {
        super::node::provision(settings, &mut cc, &node, bs.as_ref(), opts.delete_on_failure, &out).await?;
    }

    let wanted = addons::to_enable(&cc, &opts.addons);
    let enabled = addons::enable_all(bs.runner().as_ref(), &cc, &wanted, &out).await;
    for name in &wanted {
        cc.addons.insert(name.clone(), enabled.contains(name));
    }
    store
        .save(name, &cc)
        .await
        .map_err(|e| reason::with_kind(reason::HOST_SAVE_PROFILE, e))?;

    bs.update_kubeconfig(&cc, &settings.kubeconfig, &endpoint.0, endpoint.1)
        .await?;
    if cc.mount && !cc.mount_string.is_empty() {
        if let Err(e) = connect::spawn_background_mount(settings, &cc.mount_string).await {
            out.warning(format!("Unable to start the mount of {}: {:#}", cc.mount_string, e));
        }
    }

    if cc.keep_context {
        out.step(
            Icon::Celebrate,
            format!(
                "Done! kubectl is now configured to use \"{}\" cluster and \"{}\" namespace by default. The current context was kept.",
                name, cc.kubernetes_config.namespace
            ),
        );
    } else {
        out.step(
            Icon::Celebrate,
            format!(
                "Done! kubectl is now configured to use \"{}\" cluster and \"{}\" namespace by default",
                name, cc.kubernetes_config.namespace
            ),
        );
    }
    Ok(cc)
}

fn guest_start(e: anyhow::Error) -> anyhow::Error {
    if reason::kind_of(&e).is_some() {
        e
    } else {
        reason::with_kind(reason::GUEST_START, e)
    }
}

/// Fetches the ISO, the Kubernetes binaries and the preloaded images.
async fn cache_artifacts(settings: &Settings, cc: &ClusterConfig, out: &Out) -> anyhow::Result<()> {
    let home = &settings.home;
    let version = &cc.kubernetes_config.kubernetes_version;
    if driver::is_vm(&cc.driver) {
        cache::cache_iso(home, &cc.minikube_iso)
            .await
            .map_err(|e| reason::with_kind(reason::INET_CACHE_BINARIES, e))?;
    }
    if !driver::bare_metal(&cc.driver) {
        if let Some(kind) = RuntimeKind::from_name(cc.container_runtime()) {
            match cache::preload::cache_preload(home, version, kind).await {
                Ok(true) => info!(%version, "preloaded images cached"),
                Ok(false) => {}
                Err(e) => out.warning(format!("Unable to download the preloaded images: {:#}", e)),
            }
        }
    }
    cache::cache_binaries(home, version)
        .await
        .map_err(|e| reason::with_kind(reason::INET_CACHE_BINARIES, e))?;
    Ok(())
}

/// Host, runtime, Kubernetes and verification for the primary control
/// plane. Returns the apiserver endpoint and the node's bootstrapper.
async fn start_primary(
    settings: &Settings,
    cc: &mut ClusterConfig,
    primary: &Node,
    wait_timeout: Duration,
    out: &Out,
) -> anyhow::Result<((String, u16), Box<dyn Bootstrapper>)> {
    let home = &settings.home;
    let started = host::start_host(home, cc, primary, out).await?;
    let mut node = primary.clone();
    node.ip = started.ip.clone();
    if node.port == 0 {
        node.port = cc.api_server_port;
    }
    settings.store().save_node(cc, node.clone()).await?;

    let runtime = host::install_runtime(cc, started.runner.clone(), out)
        .await
        .map_err(|e| reason::with_kind(reason::RUNTIME_ENABLE, e))?;
    if let Err(e) = host::prepare_images(home, cc, started.runner.as_ref(), runtime.as_ref()).await {
        warn!(error = %e, "preparing images");
        out.warning(format!("Unable to load cached images: {:#}", e));
    }

    let bs = bootstrapper::new_bootstrapper(&settings.bootstrapper, home.clone(), started.runner.clone())?;
    bs.update_node(cc, &node, runtime.as_ref()).await?;
    bs.setup_certs(cc, &node).await?;
    out.step(Icon::Verify, "Booting up control plane ...");
    bs.start_cluster(cc)
        .await
        .map_err(|e| match reason::kind_of(&e) {
            Some(_) => e,
            None => reason::with_kind(reason::K8S_INSTALL_FAILED, e),
        })?;

    let (host_addr, port) = api_endpoint(cc, &node, &started.driver).await?;
    if !cc.wait_components().is_empty() {
        out.step(Icon::Verify, "Verifying Kubernetes components...");
    }
    bs.verify(cc, &node, &host_addr, port, wait_timeout).await?;
    Ok(((host_addr, port), bs))
}

#[cfg(test)]
mod test {
    use super::*;

    fn opts() -> StartOptions {
        StartOptions {
            memory: Some("4g".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn new_profiles_get_defaults_and_one_node() {
        let (cc, _) = generate_config("p1", None, &opts(), "docker").expect("config");
        assert_eq!(cc.driver, "docker");
        assert_eq!(cc.memory, 4096);
        assert_eq!(cc.nodes.len(), 1);
        assert!(cc.nodes[0].control_plane);
        assert_eq!(cc.nodes[0].kubernetes_version, constants::DEFAULT_KUBERNETES_VERSION);
        assert_eq!(cc.wait_components(), vec!["apiserver", "system_pods"]);
    }

    #[test]
    fn multinode_and_ha_topologies() {
        let o = StartOptions {
            nodes: 3,
            ..opts()
        };
        let (cc, _) = generate_config("p1", None, &o, "kvm2").expect("config");
        let names: Vec<&str> = cc.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "m02", "m03"]);
        assert_eq!(cc.control_planes().count(), 1);

        let ha = StartOptions {
            ha: true,
            ..opts()
        };
        let (cc, _) = generate_config("p1", None, &ha, "docker").expect("ha");
        assert_eq!(cc.control_planes().count(), 3);
        assert!(cc.is_ha());

        let err = generate_config("p1", None, &o, "none").expect_err("none is single node");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("DRV_UNSUPPORTED_MULTINODE"));
    }

    #[test]
    fn existing_profiles_keep_their_shape() {
        let (existing, _) = generate_config("p1", None, &opts(), "docker").expect("config");
        let o = StartOptions {
            nodes: 2,
            ..Default::default()
        };
        assert!(generate_config("p1", Some(&existing), &o, "docker").is_err());

        let (again, _) = generate_config("p1", Some(&existing), &StartOptions::default(), "docker").expect("restart");
        assert_eq!(again.memory, existing.memory);
        assert_eq!(again.nodes, existing.nodes);

        let downgrade = StartOptions {
            kubernetes_version: constants::OLDEST_KUBERNETES_VERSION.to_string(),
            ..Default::default()
        };
        let err = generate_config("p1", Some(&existing), &downgrade, "docker").expect_err("downgrade");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("K8S_DOWNGRADE_UNSUPPORTED"));

        let runtime = StartOptions {
            container_runtime: "containerd".to_string(),
            ..Default::default()
        };
        assert!(generate_config("p1", Some(&existing), &runtime, "docker").is_err());
    }

    #[test]
    fn wait_and_versions_are_normalized() {
        let o = StartOptions {
            kubernetes_version: "1.30.0".to_string(),
            wait: Some("all".to_string()),
            ..opts()
        };
        let (cc, _) = generate_config("p1", None, &o, "docker").expect("config");
        assert_eq!(cc.kubernetes_config.kubernetes_version, "v1.30.0");
        assert_eq!(cc.wait_components().len(), verify::ALL_COMPONENTS.len());

        let bad = StartOptions {
            container_runtime: "rkt".to_string(),
            ..opts()
        };
        let err = generate_config("p1", None, &bad, "docker").expect_err("runtime");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));
    }
}
