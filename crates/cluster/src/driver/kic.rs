//! The container driver: each node is a privileged docker or podman
//! container running systemd.
use std::path::Path;

use anyhow::Context;
use machine_rpc::MachineState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{BaseDriver, DriverCapability, PODMAN};
use crate::command::{Asset, Cmd, ExecRunner, KicRunner, RunError, RunResult, Runner};
use crate::config::{ClusterConfig, Node};
use crate::constants::{self, API_SERVER_PORT, DOCKER_DAEMON_PORT, REGISTRY_ADDON_PORT, SSH_PORT};

pub const CREATED_BY_LABEL_KEY: &str = "created_by.minikube.sigs.k8s.io";
pub const PROFILE_LABEL_KEY: &str = "name.minikube.sigs.k8s.io";
pub const NODE_ROLE_LABEL_KEY: &str = "role.minikube.sigs.k8s.io";
pub const MODE_LABEL_KEY: &str = "mode.minikube.sigs.k8s.io";

/// First subnet tried for a cluster network. Later candidates step the
/// third octet by 9.
const FIRST_SUBNET_OCTET: u8 = 49;
const SUBNET_STEP: u8 = 9;
const SUBNET_TRIES: u8 = 20;

/// Whether podman should run without sudo.
pub fn rootless() -> bool {
    std::env::var(constants::MINIKUBE_ROOTLESS_ENV)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Whether the container daemon for `oci_bin` lives on another machine.
pub fn external_daemon(oci_bin: &str) -> bool {
    let var = if oci_bin == PODMAN {
        constants::PODMAN_CONTAINER_HOST_ENV
    } else {
        constants::DOCKER_HOST_ENV
    };
    match std::env::var(var) {
        Ok(host) => !host.is_empty() && !host.starts_with("unix://") && !host.starts_with("npipe://"),
        Err(_) => false,
    }
}

/// The hostname of an external daemon, taken from its endpoint URL.
pub fn daemon_host(oci_bin: &str) -> Option<String> {
    if !external_daemon(oci_bin) {
        return None;
    }
    let var = if oci_bin == PODMAN {
        constants::PODMAN_CONTAINER_HOST_ENV
    } else {
        constants::DOCKER_HOST_ENV
    };
    let raw = std::env::var(var).ok()?;
    url::Url::parse(&raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// The argv prefix for invoking the container CLI.
fn oci_prefix(oci_bin: &str) -> Vec<String> {
    if oci_bin == PODMAN && !rootless() {
        vec!["sudo".into(), "-n".into(), oci_bin.into()]
    } else {
        vec![oci_bin.into()]
    }
}

/// Runs the container CLI on the host.
pub async fn oci<I, S>(oci_bin: &str, args: I) -> anyhow::Result<RunResult>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut argv = oci_prefix(oci_bin);
    argv.extend(args.into_iter().map(Into::into));
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    ExecRunner::default()
        .run(Cmd::new(program.clone()).args(rest.iter().cloned()))
        .await
}

fn is_missing(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RunError>().map_or(false, |e| {
        let text = e.stderr.to_lowercase();
        text.contains("no such container")
            || text.contains("no such object")
            || text.contains("no such volume")
            || text.contains("no such network")
            || text.contains("not found")
    })
}

/// The state of a container as reported by the daemon.
pub async fn container_state(oci_bin: &str, name: &str) -> anyhow::Result<MachineState> {
    match oci(oci_bin, ["container", "inspect", name, "--format", "{{.State.Status}}"]).await {
        Ok(res) => Ok(parse_status(res.stdout_str().trim())),
        Err(e) if is_missing(&e) => Ok(MachineState::None),
        Err(e) => Err(e),
    }
}

fn parse_status(status: &str) -> MachineState {
    match status {
        "running" => MachineState::Running,
        "paused" => MachineState::Paused,
        "restarting" => MachineState::Starting,
        "removing" => MachineState::Stopping,
        "exited" | "created" | "dead" | "stopped" => MachineState::Stopped,
        _ => MachineState::Error,
    }
}

/// The host port published for a container port.
pub async fn mapped_port(oci_bin: &str, name: &str, port: u16) -> anyhow::Result<u16> {
    let format = format!(
        "{{{{(index (index .NetworkSettings.Ports \"{}/tcp\") 0).HostPort}}}}",
        port
    );
    let res = oci(oci_bin, ["container", "inspect", "-f", &format, name])
        .await
        .with_context(|| format!("getting the host port for {}/tcp of {}", port, name))?;
    let raw = res.stdout_str();
    raw.trim()
        .trim_matches('\'')
        .parse()
        .with_context(|| format!("unexpected host port {:?}", raw.trim()))
}

/// IPv4 and IPv6 addresses of a container on its network.
pub async fn container_ips(oci_bin: &str, name: &str) -> anyhow::Result<(String, String)> {
    let res = oci(
        oci_bin,
        [
            "container",
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}},{{.GlobalIPv6Address}}{{end}}",
            name,
        ],
    )
    .await?;
    Ok(split_ips(&res.stdout_str()))
}

fn split_ips(raw: &str) -> (String, String) {
    let raw = raw.trim();
    match raw.split_once(',') {
        Some((v4, v6)) => (v4.to_string(), v6.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

/// Names of containers minikube created, optionally for one profile.
pub async fn list_owned(oci_bin: &str, profile: Option<&str>) -> anyhow::Result<Vec<String>> {
    let mut args = vec![
        "ps".to_string(),
        "-a".to_string(),
        "--filter".to_string(),
        format!("label={}=true", CREATED_BY_LABEL_KEY),
    ];
    if let Some(p) = profile {
        args.push("--filter".to_string());
        args.push(format!("label={}={}", PROFILE_LABEL_KEY, p));
    }
    args.extend(["--format".to_string(), "{{.Names}}".to_string()]);
    let res = oci(oci_bin, args).await?;
    Ok(res
        .stdout_str()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Removes every container, volume and network carrying minikube's labels
/// for `profile`, or for every profile when `None`.
pub async fn delete_owned(oci_bin: &str, profile: Option<&str>) -> anyhow::Result<()> {
    let label = match profile {
        Some(p) => format!("{}={}", PROFILE_LABEL_KEY, p),
        None => format!("{}=true", CREATED_BY_LABEL_KEY),
    };
    for name in list_owned(oci_bin, profile).await? {
        if let Err(e) = oci(oci_bin, ["rm", "-f", "-v", name.as_str()]).await {
            warn!(container = %name, error = %e, "unable to remove container");
        }
    }
    let res = oci(
        oci_bin,
        ["volume", "ls", "--filter", &format!("label={}", label), "--format", "{{.Name}}"],
    )
    .await?;
    for volume in res.stdout_str().lines().filter(|l| !l.trim().is_empty()) {
        if let Err(e) = oci(oci_bin, ["volume", "rm", volume.trim()]).await {
            warn!(volume, error = %e, "unable to remove volume");
        }
    }
    let res = oci(
        oci_bin,
        ["network", "ls", "--filter", &format!("label={}", label), "--format", "{{.Name}}"],
    )
    .await?;
    for network in res.stdout_str().lines().filter(|l| !l.trim().is_empty()) {
        if let Err(e) = oci(oci_bin, ["network", "rm", network.trim()]).await {
            warn!(network, error = %e, "unable to remove network");
        }
    }
    Ok(())
}

fn candidate_subnets() -> impl Iterator<Item = (String, String)> {
    (0..SUBNET_TRIES).filter_map(|i| {
        let octet = FIRST_SUBNET_OCTET.checked_add(i.checked_mul(SUBNET_STEP)?)?;
        Some((
            format!("192.168.{}.0/24", octet),
            format!("192.168.{}.1", octet),
        ))
    })
}

/// The static address a node gets on its cluster network: the primary
/// control plane is `.2`, `m02` is `.3` and so on.
pub fn node_ip(gateway: &str, node_name: &str) -> anyhow::Result<String> {
    let index: u8 = node_name
        .strip_prefix('m')
        .and_then(|n| n.parse::<u8>().ok())
        .map(|n| n.saturating_sub(1))
        .unwrap_or(0);
    let (prefix, last) = gateway
        .rsplit_once('.')
        .ok_or_else(|| anyhow::anyhow!("invalid gateway {:?}", gateway))?;
    let last: u8 = last.parse().context("invalid gateway")?;
    let host = last
        .checked_add(1)
        .and_then(|h| h.checked_add(index))
        .ok_or_else(|| anyhow::anyhow!("no address left for node {}", node_name))?;
    Ok(format!("{}.{}", prefix, host))
}

/// Settings of the node container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeConfig {
    pub cluster_name: String,
    pub container_name: String,
    pub image: String,
    #[serde(rename = "CPU")]
    pub cpu: u32,
    /// MiB.
    pub memory: u64,
    #[serde(rename = "OCIBinary")]
    pub oci_binary: String,
    /// The minikube home the node was created under.
    pub store_path: String,
    pub role: String,
    pub container_runtime: String,
    #[serde(rename = "APIServerPort")]
    pub api_server_port: u16,
    pub listen_address: String,
    pub network: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub exposed_ports: Vec<String>,
    pub mounts: Vec<String>,
    pub envs: Vec<String>,
}

/// Runs a node as a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KicDriver {
    #[serde(flatten)]
    pub base: BaseDriver,
    pub node_config: NodeConfig,
}

impl KicDriver {
    pub fn new(base: BaseDriver, oci_bin: &str) -> Self {
        let node_config = NodeConfig {
            container_name: base.machine_name.clone(),
            store_path: base.store_path.clone(),
            oci_binary: oci_bin.to_string(),
            ..Default::default()
        };
        KicDriver { base, node_config }
    }

    fn name(&self) -> &str {
        &self.node_config.container_name
    }

    fn oci_bin(&self) -> &str {
        &self.node_config.oci_binary
    }

    fn runner(&self) -> KicRunner {
        KicRunner::new(self.name(), self.oci_bin())
    }

    /// Arguments of `run` creating the node container.
    pub fn run_args(&self) -> Vec<String> {
        let nc = &self.node_config;
        let name = nc.container_name.as_str();
        let listen = if nc.listen_address.is_empty() {
            "127.0.0.1"
        } else {
            nc.listen_address.as_str()
        };
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-t".into(),
            "--privileged".into(),
            "--security-opt".into(),
            "seccomp=unconfined".into(),
            "--tmpfs".into(),
            "/tmp".into(),
            "--tmpfs".into(),
            "/run".into(),
            "-v".into(),
            "/lib/modules:/lib/modules:ro".into(),
            "--hostname".into(),
            name.into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("{}=true", CREATED_BY_LABEL_KEY),
            "--label".into(),
            format!("{}={}", PROFILE_LABEL_KEY, nc.cluster_name),
            "--label".into(),
            format!("{}={}", NODE_ROLE_LABEL_KEY, nc.role),
            "--label".into(),
            format!("{}={}", MODE_LABEL_KEY, name),
        ];
        if !nc.network.is_empty() {
            args.push(format!("--network={}", nc.network));
            if !nc.ip.is_empty() {
                args.push(format!("--ip={}", nc.ip));
            }
        }
        if nc.oci_binary == PODMAN {
            args.push(format!("--volume={}:/var:exec", name));
        } else {
            args.push(format!("--volume={}:/var", name));
            args.extend(["--security-opt".to_string(), "apparmor=unconfined".to_string()]);
        }
        for m in &nc.mounts {
            args.push(format!("--volume={}", m));
        }
        if nc.memory > 0 {
            args.push(format!("--memory={}mb", nc.memory));
            args.push(format!("--memory-swap={}mb", nc.memory));
        }
        if nc.cpu > 0 {
            args.push(format!("--cpus={}", nc.cpu));
        }
        args.extend(["-e".to_string(), "container=docker".to_string()]);
        for e in &nc.envs {
            args.extend(["-e".to_string(), e.clone()]);
        }
        let api_port = if nc.api_server_port == 0 {
            API_SERVER_PORT
        } else {
            nc.api_server_port
        };
        args.push(format!("--expose={}", api_port));
        for port in [api_port, SSH_PORT, DOCKER_DAEMON_PORT, REGISTRY_ADDON_PORT] {
            args.push(format!("--publish={}::{}", listen, port));
        }
        for p in &nc.exposed_ports {
            args.push(format!("--publish={}", p));
        }
        args.push(nc.image.clone());
        args
    }

    async fn ensure_network(&mut self) -> anyhow::Result<()> {
        let network = self.node_config.network.clone();
        if network.is_empty() || network == "bridge" || network == "host" {
            return Ok(());
        }
        let inspect = oci(
            self.oci_bin(),
            ["network", "inspect", network.as_str(), "--format", "{{range .IPAM.Config}}{{.Gateway}}{{end}}"],
        )
        .await;
        let gateway = match inspect {
            Ok(res) => res.stdout_str().trim().to_string(),
            Err(e) if is_missing(&e) => self.create_network(&network).await?,
            Err(e) => return Err(e),
        };
        if !gateway.is_empty() && self.node_config.ip.is_empty() {
            let node = self
                .name()
                .rsplit_once('-')
                .map(|(_, n)| n.to_string())
                .unwrap_or_default();
            self.node_config.ip = node_ip(&gateway, &node)?;
        }
        Ok(())
    }

    async fn create_network(&self, network: &str) -> anyhow::Result<String> {
        let mut last_err = None;
        for (subnet, gateway) in candidate_subnets() {
            let res = oci(
                self.oci_bin(),
                [
                    "network".to_string(),
                    "create".to_string(),
                    "--driver=bridge".to_string(),
                    format!("--subnet={}", subnet),
                    format!("--gateway={}", gateway),
                    "--label".to_string(),
                    format!("{}=true", CREATED_BY_LABEL_KEY),
                    "--label".to_string(),
                    format!("{}={}", PROFILE_LABEL_KEY, self.node_config.cluster_name),
                    network.to_string(),
                ],
            )
            .await;
            match res {
                Ok(_) => {
                    info!(network, subnet = %subnet, "created network");
                    return Ok(gateway);
                }
                Err(e) => {
                    debug!(subnet = %subnet, error = %e, "subnet is taken");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no free subnet"))
            .context(format!("creating network {}", network)))
    }

    async fn ensure_ssh_key(&self) -> anyhow::Result<String> {
        let key = self.base.resolved_ssh_key_path();
        if let Some(dir) = Path::new(&key).parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        if !Path::new(&key).exists() {
            ExecRunner::default()
                .run(Cmd::new("ssh-keygen").args(["-q", "-t", "rsa", "-N", "", "-f", key.as_str()]))
                .await
                .context("generating ssh key")?;
        }
        let public = tokio::fs::read(format!("{}.pub", key))
            .await
            .context("reading ssh public key")?;
        let runner = self.runner();
        runner
            .copy(&Asset::memory(public, "/home/docker/.ssh", "authorized_keys", "0644"))
            .await
            .context("installing ssh key")?;
        runner
            .run(Cmd::sudo("chown").args(["-R", "docker:docker", "/home/docker/.ssh"]))
            .await?;
        Ok(key)
    }
}

#[async_trait::async_trait]
impl DriverCapability for KicDriver {
    fn driver_name(&self) -> String {
        self.oci_bin().to_string()
    }

    async fn pre_create_check(&mut self) -> anyhow::Result<()> {
        oci(self.oci_bin(), ["version"])
            .await
            .with_context(|| format!("{} is not responding", self.oci_bin()))?;
        Ok(())
    }

    #[instrument(level = "info", skip(self, cc, node), fields(container = %self.name()))]
    async fn create(&mut self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()> {
        let nc = &mut self.node_config;
        nc.cluster_name = cc.name.clone();
        nc.image = cc.kic_base_image.clone();
        nc.cpu = cc.cpus;
        nc.memory = cc.memory;
        nc.role = if node.control_plane {
            "control-plane".to_string()
        } else {
            String::new()
        };
        nc.container_runtime = cc.container_runtime().to_string();
        nc.api_server_port = cc.api_server_port;
        nc.listen_address = cc.listen_address.clone();
        nc.network = if cc.network.is_empty() {
            cc.name.clone()
        } else {
            cc.network.clone()
        };
        nc.exposed_ports = cc.exposed_ports.clone();
        nc.mounts = cc.container_volume_mounts.clone();
        if !cc.disable_driver_mounts && cc.mount && !cc.mount_string.is_empty() {
            nc.mounts.push(cc.mount_string.clone());
        }
        if cc.kubernetes_config.kubernetes_version == constants::NO_KUBERNETES_VERSION {
            nc.envs.push("MINIKUBE_NO_KUBERNETES=true".to_string());
        }

        self.ensure_network().await?;
        let name = self.name().to_string();
        let volume = oci(
            self.oci_bin(),
            [
                "volume".to_string(),
                "create".to_string(),
                name.clone(),
                "--label".to_string(),
                format!("{}={}", PROFILE_LABEL_KEY, cc.name),
                "--label".to_string(),
                format!("{}=true", CREATED_BY_LABEL_KEY),
            ],
        )
        .await;
        if let Err(e) = volume {
            debug!(error = %e, "volume create failed, assuming it exists");
        }
        oci(self.oci_bin(), self.run_args())
            .await
            .with_context(|| format!("creating container {}", name))?;
        self.base.ssh_key_path = self.ensure_ssh_key().await?;
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        oci(self.oci_bin(), ["start", self.name()]).await?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self
            .runner()
            .run(Cmd::sudo("systemctl").args(["stop", "kubelet"]))
            .await
        {
            debug!(error = %e, "unable to stop kubelet");
        }
        oci(self.oci_bin(), ["stop", self.name()]).await?;
        Ok(())
    }

    async fn remove(&mut self) -> anyhow::Result<()> {
        match oci(self.oci_bin(), ["rm", "-f", "-v", self.name()]).await {
            Ok(_) => {}
            Err(e) if is_missing(&e) => debug!("container already gone"),
            Err(e) => return Err(e),
        }
        if let Err(e) = oci(self.oci_bin(), ["volume", "rm", self.name()]).await {
            debug!(error = %e, "volume already gone");
        }
        Ok(())
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        oci(self.oci_bin(), ["kill", self.name()]).await?;
        Ok(())
    }

    async fn ip(&self) -> anyhow::Result<String> {
        let (v4, v6) = container_ips(self.oci_bin(), self.name()).await?;
        if v4.is_empty() {
            Ok(v6)
        } else {
            Ok(v4)
        }
    }

    async fn ssh_hostname(&self) -> anyhow::Result<String> {
        Ok(daemon_host(self.oci_bin()).unwrap_or_else(|| "127.0.0.1".to_string()))
    }

    async fn ssh_port(&self) -> anyhow::Result<u16> {
        mapped_port(self.oci_bin(), self.name(), SSH_PORT).await
    }

    async fn ssh_key_path(&self) -> anyhow::Result<String> {
        Ok(self.base.resolved_ssh_key_path())
    }

    async fn ssh_username(&self) -> anyhow::Result<String> {
        Ok("docker".to_string())
    }

    async fn state(&self) -> anyhow::Result<MachineState> {
        container_state(self.oci_bin(), self.name()).await
    }

    async fn url(&self) -> anyhow::Result<String> {
        let host = self.ssh_hostname().await?;
        let port = mapped_port(self.oci_bin(), self.name(), DOCKER_DAEMON_PORT).await?;
        Ok(format!("tcp://{}:{}", host, port))
    }

    async fn config_raw(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    async fn set_config_raw(&mut self, raw: serde_json::Value) -> anyhow::Result<()> {
        let oci_bin = self.node_config.oci_binary.clone();
        *self = serde_json::from_value(raw).context("decoding kic driver config")?;
        if self.node_config.oci_binary.is_empty() {
            self.node_config.oci_binary = oci_bin;
        }
        if self.node_config.container_name.is_empty() {
            self.node_config.container_name = self.base.machine_name.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn driver() -> KicDriver {
        let mut d = KicDriver::new(BaseDriver::new("p1", "/home/u/.minikube"), "docker");
        d.node_config.cluster_name = "p1".to_string();
        d.node_config.image = "kicbase:test".to_string();
        d.node_config.role = "control-plane".to_string();
        d.node_config.network = "p1".to_string();
        d.node_config.ip = "192.168.49.2".to_string();
        d.node_config.cpu = 2;
        d.node_config.memory = 2200;
        d
    }

    #[test]
    fn run_arguments() {
        let args = driver().run_args();
        assert_eq!(args[0], "run");
        assert_eq!(args.last().map(String::as_str), Some("kicbase:test"));
        for expected in [
            "--hostname",
            "--network=p1",
            "--ip=192.168.49.2",
            "--volume=p1:/var",
            "--memory=2200mb",
            "--cpus=2",
            "--publish=127.0.0.1::8443",
            "--publish=127.0.0.1::22",
            "--publish=127.0.0.1::2376",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
        assert!(args.contains(&"name.minikube.sigs.k8s.io=p1".to_string()));
        assert!(args.contains(&"role.minikube.sigs.k8s.io=control-plane".to_string()));
    }

    #[test]
    fn podman_volumes_are_exec() {
        let mut d = driver();
        d.node_config.oci_binary = "podman".to_string();
        assert!(d.run_args().contains(&"--volume=p1:/var:exec".to_string()));
    }

    #[test]
    fn statuses() {
        assert_eq!(parse_status("running"), MachineState::Running);
        assert_eq!(parse_status("exited"), MachineState::Stopped);
        assert_eq!(parse_status("paused"), MachineState::Paused);
        assert_eq!(parse_status("bogus"), MachineState::Error);
    }

    #[test]
    fn addresses() {
        assert_eq!(node_ip("192.168.49.1", "").expect("primary"), "192.168.49.2");
        assert_eq!(node_ip("192.168.49.1", "m02").expect("m02"), "192.168.49.3");
        assert_eq!(node_ip("192.168.58.1", "m03").expect("m03"), "192.168.58.4");
        assert_eq!(split_ips("192.168.49.2,\n"), ("192.168.49.2".into(), "".into()));
        let subnets: Vec<_> = candidate_subnets().take(2).collect();
        assert_eq!(subnets[0].0, "192.168.49.0/24");
        assert_eq!(subnets[1].1, "192.168.58.1");
    }

    #[tokio::test]
    async fn raw_config_keeps_store_path() {
        let d = driver();
        let raw = d.config_raw().await.expect("raw");
        assert_eq!(raw["StorePath"], "/home/u/.minikube");
        assert_eq!(raw["NodeConfig"]["StorePath"], "/home/u/.minikube");
        let mut back = KicDriver::new(BaseDriver::default(), "docker");
        back.set_config_raw(raw).await.expect("decode");
        assert_eq!(back, d);
    }
}
