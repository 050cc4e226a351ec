//! `minikube node`: adding, starting, stopping and removing single nodes.
use tracing::{info, instrument, warn};

use crate::bootstrapper::{self, Bootstrapper};
use crate::command::Cmd;
use crate::config::{self, machine_name, ClusterConfig, Node, Settings};
use crate::driver;
use crate::host;
use crate::machine::MachineStore;
use crate::out::{Icon, Out};
use crate::reason;

use super::{find_node, load_config, ClusterController, NodeHandle, PROFILE_LOCK_TIMEOUT};

pub const LINUX: &str = "linux";
pub const WINDOWS: &str = "windows";
/// The Windows Server release used when `--os=windows` names none.
pub const DEFAULT_WINDOWS_VERSION: &str = "2022";

/// Flags of `minikube node add`.
#[derive(Clone, Debug)]
pub struct AddOptions {
    pub control_plane: bool,
    pub worker: bool,
    pub os: String,
    pub delete_on_failure: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        AddOptions {
            control_plane: false,
            worker: true,
            os: String::new(),
            delete_on_failure: false,
        }
    }
}

/// Parses `--os`, either a bare OS name or `os=<name>,version=<v>`.
///
/// Returns the OS, its version and any warning to show. Linux nodes carry
/// no version.
pub fn parse_os(flag: &str) -> anyhow::Result<(String, String, Option<String>)> {
    let flag = flag.trim();
    if flag.is_empty() {
        return Ok((LINUX.to_string(), String::new(), None));
    }
    let mut os = String::new();
    let mut version = String::new();
    if flag.contains('=') {
        for pair in flag.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("os", v)) => os = v.trim().to_lowercase(),
                Some(("version", v)) => version = v.trim().to_string(),
                _ => {
                    return Err(reason::usage(format!(
                        "invalid --os value {:?}, expected os=<linux|windows>[,version=<version>]",
                        flag
                    )))
                }
            }
        }
    } else {
        os = flag.to_lowercase();
    }
    match os.as_str() {
        LINUX => {
            let warning = if version.is_empty() {
                None
            } else {
                Some(format!("Ignoring version {:?} for a linux node", version))
            };
            Ok((os, String::new(), warning))
        }
        WINDOWS => {
            if version.is_empty() {
                version = DEFAULT_WINDOWS_VERSION.to_string();
            }
            Ok((os, version, None))
        }
        other => Err(reason::usage(format!(
            "unsupported node OS {:?}, valid values are: linux, windows",
            other
        ))),
    }
}

/// Builds the node `node add` appends to `cc`.
pub fn new_node(cc: &ClusterConfig, opts: &AddOptions) -> anyhow::Result<(Node, Option<String>)> {
    let (os, os_version, warning) = parse_os(&opts.os)?;
    if opts.control_plane && os == WINDOWS {
        return Err(reason::usage("Windows nodes can only be added as workers"));
    }
    if !opts.control_plane && !opts.worker {
        return Err(reason::usage("a node must be a control plane, a worker, or both"));
    }
    if !driver::allows_multi_node(&cc.driver) {
        return Err(reason::with_kind(
            reason::DRV_UNSUPPORTED_MULTINODE,
            anyhow::anyhow!("The {} driver does not support multi-node clusters", cc.driver),
        ));
    }
    if opts.control_plane && !cc.is_ha() {
        return Err(reason::usage(
            "Adding a control plane node to a non-HA cluster is not supported. Start a new cluster with --ha to use multiple control planes.",
        ));
    }
    let node = Node {
        name: cc.next_node_name(),
        kubernetes_version: cc.kubernetes_config.kubernetes_version.clone(),
        container_runtime: cc.container_runtime().to_string(),
        control_plane: opts.control_plane,
        worker: opts.worker,
        port: if opts.control_plane { cc.api_server_port } else { 0 },
        os: if os == LINUX { String::new() } else { os },
        os_version,
        ..Default::default()
    };
    Ok((node, warning))
}

/// Brings up `node` and joins it to the cluster whose primary control plane
/// is driven by `cp`. Retries once from a fresh machine when
/// `delete_on_failure` is set.
pub async fn provision(
    settings: &Settings,
    cc: &mut ClusterConfig,
    node: &Node,
    cp: &dyn Bootstrapper,
    delete_on_failure: bool,
    out: &Out,
) -> anyhow::Result<()> {
    out.step(
        Icon::Running,
        format!(
            "Starting \"{}\" {} node in \"{}\" cluster",
            machine_name(cc, node),
            if node.control_plane { "control-plane" } else { "worker" },
            cc.name
        ),
    );
    match join_node(settings, cc, node, cp, out).await {
        Ok(()) => Ok(()),
        Err(e) if delete_on_failure => {
            let name = machine_name(cc, node);
            out.warning(format!("Failed to start node {}, deleting it and trying again: {:#}", name, e));
            host::delete_host(&MachineStore::new(settings.home.clone()), &name).await?;
            join_node(settings, cc, node, cp, out).await.map_err(node_start)
        }
        Err(e) => Err(node_start(e)),
    }
}

fn node_start(e: anyhow::Error) -> anyhow::Error {
    if reason::kind_of(&e).is_some() {
        e
    } else {
        reason::with_kind(reason::GUEST_NODE_START, e)
    }
}

#[instrument(level = "info", skip_all, fields(node = %node.name))]
async fn join_node(settings: &Settings, cc: &mut ClusterConfig, node: &Node, cp: &dyn Bootstrapper, out: &Out) -> anyhow::Result<()> {
    let home = &settings.home;
    let started = host::start_host(home, cc, node, out).await?;
    let mut node = node.clone();
    node.ip = started.ip.clone();
    settings.store().save_node(cc, node.clone()).await?;

    let runtime = host::install_runtime(cc, started.runner.clone(), out).await?;
    if let Err(e) = host::prepare_images(home, cc, started.runner.as_ref(), runtime.as_ref()).await {
        warn!(error = %e, "preparing images");
    }
    let bs = bootstrapper::new_bootstrapper(&settings.bootstrapper, home.clone(), started.runner.clone())?;
    bs.update_node(cc, &node, runtime.as_ref()).await?;
    // Workers only need the join token; control planes share the cluster CA.
    if node.control_plane {
        bs.setup_certs(cc, &node).await?;
    }
    if started.existed && bs.existing_config().await {
        info!(node = %node.name, "node already joined, restarting kubelet");
        started
            .runner
            .run(Cmd::sudo("systemctl").args(["restart", "kubelet"]))
            .await?;
        return Ok(());
    }
    let join = cp.join_command(cc).await?;
    bs.join(cc, &node, &join, runtime.as_ref()).await
}

/// `node add`.
pub async fn add(settings: &Settings, opts: &AddOptions) -> anyhow::Result<Node> {
    let out = settings.out();
    let store = settings.store();
    let ctl = ClusterController::load(settings).await?;
    let _lock = store.lock(&settings.profile, PROFILE_LOCK_TIMEOUT).await?;
    let mut cc = ctl.config.clone();
    let (node, warning) = new_node(&cc, opts)?;
    if let Some(w) = warning {
        out.warning(w);
    }
    out.step(
        Icon::Happy,
        format!("Adding node {} to cluster {} as {}", node.name, cc.name, role(&node)),
    );
    store
        .save_node(&mut cc, node.clone())
        .await
        .map_err(|e| reason::with_kind(reason::HOST_SAVE_PROFILE, e))?;
    let cp = bootstrapper::new_bootstrapper(&settings.bootstrapper, settings.home.clone(), ctl.cp.handle.runner.clone())?;
    if let Err(e) = provision(settings, &mut cc, &node, cp.as_ref(), opts.delete_on_failure, &out).await {
        return Err(match reason::kind_of(&e) {
            Some(_) => e,
            None => reason::with_kind(reason::GUEST_NODE_ADD, e),
        });
    }
    out.step(Icon::Check, format!("Successfully added {} to {}!", node.name, cc.name));
    Ok(node)
}

fn role(node: &Node) -> &'static str {
    match (node.control_plane, node.worker) {
        (true, true) => "[control-plane worker]",
        (true, false) => "[control-plane]",
        _ => "[worker]",
    }
}

/// `node start NAME`.
pub async fn start(settings: &Settings, name: &str, delete_on_failure: bool) -> anyhow::Result<()> {
    let out = settings.out();
    let mut cc = load_config(&settings.store(), &settings.profile).await?;
    let node = find_node(&cc, name)?;
    let machine = machine_name(&cc, &node);
    if let Ok(handle) = NodeHandle::load(&settings.home, &cc, &node).await {
        if handle.state().await? == machine_rpc::MachineState::Running {
            out.step(Icon::Check, format!("{} is already running", machine));
            return Ok(());
        }
    }
    let primary = cc
        .primary_control_plane()
        .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e))?;
    if primary.name == node.name {
        return Err(reason::usage(format!(
            "{} is the primary control plane, use \"minikube start {}\" instead",
            machine,
            settings.profile_arg()
        )));
    }
    let ctl = ClusterController::from_config(&settings.home, cc.clone()).await?;
    let cp = bootstrapper::new_bootstrapper(&settings.bootstrapper, settings.home.clone(), ctl.cp.handle.runner.clone())?;
    provision(settings, &mut cc, &node, cp.as_ref(), delete_on_failure, &out).await?;
    out.step(Icon::Happy, format!("Successfully started node {}!", machine));
    Ok(())
}

/// `node stop NAME`.
pub async fn stop(settings: &Settings, name: &str) -> anyhow::Result<()> {
    let out = settings.out();
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let node = find_node(&cc, name)?;
    let machine = machine_name(&cc, &node);
    out.step(Icon::Stopping, format!("Stopping node \"{}\"  ...", machine));
    host::stop_host(&MachineStore::new(settings.home.clone()), &machine).await?;
    out.step(Icon::Check, format!("Successfully stopped node {}", machine));
    Ok(())
}

/// `node delete NAME`: drains and removes the node from Kubernetes, then
/// deletes its machine and its entry in the profile.
pub async fn delete(settings: &Settings, name: &str) -> anyhow::Result<()> {
    let out = settings.out();
    let store = settings.store();
    let mut cc = load_config(&store, &settings.profile).await?;
    let _lock = store.lock(&settings.profile, PROFILE_LOCK_TIMEOUT).await?;
    let node = find_node(&cc, name)?;
    let primary = cc
        .primary_control_plane()
        .map_err(|e| reason::with_kind(reason::GUEST_CP_CONFIG, e))?;
    if node.name == primary.name {
        return Err(reason::usage("The primary control plane node cannot be deleted, delete the cluster instead"));
    }
    let machine = machine_name(&cc, &node);
    out.step(Icon::Deleting, format!("Deleting node {} from cluster {}", node.name, cc.name));

    match ClusterController::from_config(&settings.home, cc.clone()).await {
        Ok(ctl) => {
            if let Err(e) = drain(&ctl, &machine).await {
                out.warning(format!("Failed to drain node {}: {:#}", machine, e));
            }
        }
        Err(e) => warn!(error = %e, "control plane unavailable, skipping drain"),
    }
    host::delete_host(&MachineStore::new(settings.home.clone()), &machine)
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_NODE_DELETE, e))?;
    cc.nodes.retain(|n| n.name != node.name);
    store
        .save(&cc.name, &cc)
        .await
        .map_err(|e| reason::with_kind(reason::HOST_SAVE_PROFILE, e))?;
    out.step(Icon::Deleting, format!("Node {} was successfully deleted.", node.name));
    Ok(())
}

async fn drain(ctl: &ClusterController, machine: &str) -> anyhow::Result<()> {
    let kubectl = format!(
        "{}/{}/kubectl",
        crate::constants::vmpath::GUEST_BINARIES_DIR,
        ctl.config.kubernetes_config.kubernetes_version
    );
    let kc = format!("--kubeconfig={}", crate::constants::vmpath::GUEST_KUBECONFIG);
    let runner = &ctl.cp.handle.runner;
    runner
        .run(Cmd::sudo(&kubectl).args([
            kc.as_str(),
            "drain",
            machine,
            "--force",
            "--grace-period=1",
            "--skip-wait-for-delete-timeout=1",
            "--disable-eviction",
            "--ignore-daemonsets",
            "--delete-emptydir-data",
        ]))
        .await?;
    runner
        .run(Cmd::sudo(&kubectl).args([kc.as_str(), "delete", "node", machine]))
        .await?;
    Ok(())
}

/// One row of `node list`.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRow {
    pub name: String,
    pub ip: String,
}

/// `node list`: machine names and addresses, primary first.
pub async fn list(settings: &Settings) -> anyhow::Result<Vec<NodeRow>> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    Ok(rows(&cc))
}

pub fn rows(cc: &ClusterConfig) -> Vec<NodeRow> {
    cc.nodes
        .iter()
        .map(|n| NodeRow {
            name: config::machine_name(cc, n),
            ip: n.ip.clone(),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;

    #[test]
    fn os_flags_are_parsed() {
        assert_eq!(parse_os("").expect("empty"), ("linux".to_string(), String::new(), None));
        let (os, version, warning) = parse_os("os=linux,version=2022").expect("linux");
        assert_eq!(os, "linux");
        assert_eq!(version, "");
        assert!(warning.expect("warning").contains("2022"));
        assert_eq!(
            parse_os("windows").expect("windows"),
            ("windows".to_string(), "2022".to_string(), None)
        );
        assert_eq!(parse_os("os=windows,version=2019").expect("2019").1, "2019");
        assert!(parse_os("os=plan9").is_err());
        assert!(parse_os("distro=arch").is_err());
    }

    #[test]
    fn windows_control_planes_are_refused() {
        let cc = cluster("p1", "docker", 0);
        let opts = AddOptions {
            control_plane: true,
            os: "os=windows".to_string(),
            ..Default::default()
        };
        let err = new_node(&cc, &opts).expect_err("windows cp");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));
    }

    #[test]
    fn added_nodes_get_the_next_name() {
        let cc = cluster("p1", "docker", 1);
        let (node, _) = new_node(&cc, &AddOptions::default()).expect("worker");
        assert_eq!(node.name, "m03");
        assert!(node.worker && !node.control_plane);
        assert_eq!(node.port, 0);

        let cp = AddOptions {
            control_plane: true,
            ..Default::default()
        };
        assert!(new_node(&cc, &cp).is_err(), "single control plane clusters are not HA");

        let none = cluster("p1", "none", 0);
        let err = new_node(&none, &AddOptions::default()).expect_err("none driver");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("DRV_UNSUPPORTED_MULTINODE"));
    }

    #[test]
    fn ha_clusters_accept_control_planes() {
        let mut cc = cluster("p1", "docker", 2);
        for n in cc.nodes.iter_mut() {
            n.control_plane = true;
        }
        let opts = AddOptions {
            control_plane: true,
            ..Default::default()
        };
        let (node, _) = new_node(&cc, &opts).expect("cp");
        assert_eq!(node.name, "m04");
        assert_eq!(node.port, cc.api_server_port);
    }

    #[test]
    fn even_control_plane_counts_refuse_more_control_planes() {
        let mut cc = cluster("p1", "docker", 1);
        for n in cc.nodes.iter_mut() {
            n.control_plane = true;
        }
        let opts = AddOptions {
            control_plane: true,
            ..Default::default()
        };
        let err = new_node(&cc, &opts).expect_err("two control planes are not HA");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));
    }

    #[test]
    fn rows_use_machine_names() {
        let cc = cluster("p1", "docker", 1);
        assert_eq!(
            rows(&cc),
            vec![
                NodeRow {
                    name: "p1".to_string(),
                    ip: "192.168.49.2".to_string()
                },
                NodeRow {
                    name: "p1-m02".to_string(),
                    ip: "192.168.49.3".to_string()
                },
            ]
        );
    }
}
