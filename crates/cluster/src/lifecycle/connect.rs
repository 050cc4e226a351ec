//! Host to guest connectivity: `docker-env`, `podman-env`, `tunnel` and
//! `mount`.
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{shell_quote, Cmd, ExecRunner, Runner};
use crate::config::{machine_name, ClusterConfig, Settings};
use crate::constants;
use crate::cruntime::RuntimeKind;
use crate::driver::{self, kic};
use crate::env::{self, DockerEnv, PodmanEnv, Shell, SshAgent, SshEndpoint};
use crate::handle::StopHandler;
use crate::kubeconfig;
use crate::mount::{self, Mount, MountConfig, MountRequest};
use crate::out::Icon;
use crate::reason;
use crate::tunnel::{self, ssh, LoadBalancerTunnel, Registry, Route, Router, ServicePatcher, StatusPatcher};

use super::access::ssh_client;
use super::{load_config, ClusterController};

/// Flags shared by `docker-env` and `podman-env`.
#[derive(Clone, Debug, Default)]
pub struct EnvOptions {
    pub shell: String,
    pub unset: bool,
    pub no_proxy: bool,
    pub ssh_host: bool,
    pub ssh_add: bool,
    /// `text`, `json` or `yaml`; only honored with `--shell none`.
    pub output: String,
}

fn shell_for(opts: &EnvOptions, environ: &BTreeMap<String, String>) -> anyhow::Result<Shell> {
    env::detect_shell(&opts.shell, environ).map_err(|e| match reason::kind_of(&e) {
        Some(_) => e,
        None => reason::with_kind(reason::INTERNAL_SHELL_DETECT, e),
    })
}

fn structured_format(opts: &EnvOptions, shell: Shell) -> anyhow::Result<Option<env::Format>> {
    if shell != Shell::None {
        return Ok(None);
    }
    match opts.output.parse()? {
        env::Format::Text => Ok(None),
        f => Ok(Some(f)),
    }
}

async fn ssh_endpoint(ctl: &ClusterController) -> anyhow::Result<SshEndpoint> {
    let client = ssh_client(&ctl.cp.handle)
        .await
        .map_err(|e| reason::with_kind(reason::IF_SSH_CLIENT, e))?;
    Ok(SshEndpoint {
        user: client.user,
        host: client.hostname,
        port: client.port,
        key_path: client.key_path.display().to_string(),
    })
}

/// Adds `key` to the caller's ssh-agent, starting one when none is
/// reachable. Returns the agent that was started, if any.
async fn ssh_add(key: &str, environ: &BTreeMap<String, String>) -> anyhow::Result<Option<SshAgent>> {
    let host = ExecRunner::new();
    let (agent, sock) = match environ.get(constants::SSH_AUTH_SOCK_ENV).filter(|s| !s.is_empty()) {
        Some(sock) => (None, sock.clone()),
        None => {
            let res = host
                .run(Cmd::new("ssh-agent").arg("-s"))
                .await
                .context("starting ssh-agent")?;
            let agent = env::parse_ssh_agent(&res.stdout_str())
                .ok_or_else(|| anyhow::anyhow!("unexpected ssh-agent output {:?}", res.stdout_str()))?;
            let sock = agent.auth_sock.clone();
            (Some(agent), sock)
        }
    };
    host.run(Cmd::shell(format!(
        "{}={} ssh-add {}",
        constants::SSH_AUTH_SOCK_ENV,
        shell_quote(&sock),
        shell_quote(key)
    )))
    .await
    .context("adding the node's key to ssh-agent")?;
    Ok(agent)
}

/// Where the guest's Docker daemon listens, as reachable from this host.
async fn docker_endpoint(ctl: &ClusterController) -> anyhow::Result<(String, u16)> {
    let cc = &ctl.config;
    if driver::is_kic(&cc.driver) {
        let host = kic::daemon_host(&cc.driver).unwrap_or_else(|| "127.0.0.1".to_string());
        let port = kic::mapped_port(&cc.driver, &ctl.cp.handle.machine_name, constants::DOCKER_DAEMON_PORT)
            .await
            .map_err(|e| reason::with_kind(reason::DRV_CP_ENDPOINT, e))?;
        return Ok((host, port));
    }
    Ok((ctl.cp.ip.clone(), constants::DOCKER_DAEMON_PORT))
}

/// The `docker-env` script for the profile in `settings`.
pub async fn docker_env(settings: &Settings, opts: &EnvOptions, environ: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let shell = shell_for(opts, environ)?;
    let format = structured_format(opts, shell)?;

    if opts.unset {
        let e = DockerEnv {
            profile: settings.profile.clone(),
            no_proxy: opts.no_proxy,
            environ: environ.clone(),
            ..Default::default()
        };
        return match format {
            Some(f) => env::structured_names(f, &env::docker_unset_vars(&e).0),
            None => Ok(env::docker_unset_script(shell, &e)),
        };
    }

    let cc = load_config(&settings.store(), &settings.profile).await?;
    env::check_docker_env(&cc)?;
    let ctl = ClusterController::from_config(&settings.home, cc).await?;
    let runtime = ctl.cp.handle.runtime(&ctl.config)?;
    if runtime.kind() == RuntimeKind::Docker && !runtime.active().await {
        return Err(reason::with_kind(
            reason::ENV_DOCKER_UNAVAILABLE,
            anyhow::anyhow!("The docker service within '{}' is not active", ctl.profile()),
        ));
    }

    let (host_ip, port) = docker_endpoint(&ctl).await?;
    let ssh = if opts.ssh_host || opts.ssh_add {
        Some(ssh_endpoint(&ctl).await?)
    } else {
        None
    };
    let agent = match (&ssh, opts.ssh_add) {
        (Some(s), true) => ssh_add(&s.key_path, environ).await?,
        _ => None,
    };
    let e = DockerEnv {
        profile: ctl.profile().to_string(),
        driver: ctl.config.driver.clone(),
        host_ip,
        port,
        certs_dir: settings.home.certs_dir().display().to_string(),
        ssh: if opts.ssh_host { ssh } else { None },
        agent,
        no_proxy: opts.no_proxy,
        environ: environ.clone(),
    };
    debug!(profile = %e.profile, host = %e.host_ip, port = e.port, "docker-env");
    match format {
        Some(f) => env::structured(f, &env::docker_env_vars(&e)),
        None => Ok(env::docker_set_script(shell, &e)),
    }
}

/// The `podman-env` script for the profile in `settings`.
pub async fn podman_env(settings: &Settings, opts: &EnvOptions, environ: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let shell = shell_for(opts, environ)?;
    let format = structured_format(opts, shell)?;
    if opts.unset {
        let names = env::podman_unset_names();
        return match format {
            Some(f) => env::structured_names(f, &names),
            None => Ok(env::unset_script(shell, &names)),
        };
    }

    let cc = load_config(&settings.store(), &settings.profile).await?;
    env::check_podman_env(&cc)?;
    let ctl = ClusterController::from_config(&settings.home, cc).await?;
    let active = ctl
        .cp
        .handle
        .runner
        .run(Cmd::sudo("systemctl").args(["-q", "is-active", "podman.socket"]))
        .await
        .is_ok();
    if !active {
        return Err(reason::with_kind(
            reason::ENV_PODMAN_UNAVAILABLE,
            anyhow::anyhow!("The podman service within '{}' is not active", ctl.profile()),
        ));
    }
    let e = PodmanEnv {
        profile: ctl.profile().to_string(),
        ssh: ssh_endpoint(&ctl).await?,
    };
    match format {
        Some(f) => env::structured(f, &env::podman_env_vars(&e)),
        None => Ok(env::podman_set_script(shell, &e)),
    }
}

/// The route `tunnel` installs for `cc`: the service CIDR through the
/// control plane.
pub fn service_route(cc: &ClusterConfig, gateway: &str) -> Route {
    Route {
        gateway: gateway.to_string(),
        dest_cidr: cc.kubernetes_config.service_cidr.clone(),
    }
}

fn host_router() -> Router {
    Router::new(reason::host_os(), Arc::new(ExecRunner::new()))
}

/// `minikube tunnel --cleanup`: removes the routes of crashed tunnels.
pub async fn tunnel_cleanup(settings: &Settings) -> anyhow::Result<usize> {
    let registry = Registry::for_current_user(&settings.home);
    let removed = tunnel::cleanup_stale(&registry, &host_router())
        .await
        .map_err(|e| reason::with_kind(reason::SVC_TUNNEL_STOP, e))?;
    settings
        .out()
        .step(Icon::Check, format!("Removed {} stale tunnel route(s)", removed));
    Ok(removed)
}

/// `minikube tunnel`: runs until `token` is cancelled.
///
/// Guests reachable from the host get a route from the service CIDR; the
/// others get an ssh forward per LoadBalancer Service. A remote container
/// daemon additionally gets an apiserver forward for the lifetime of the
/// tunnel.
pub async fn tunnel(settings: &Settings, cleanup: bool, token: CancellationToken) -> anyhow::Result<()> {
    let out = settings.out();
    if cleanup {
        tunnel_cleanup(settings).await?;
    }
    let ctl = ClusterController::load(settings).await?;
    let client = kubeconfig::client(&settings.kubeconfig, ctl.profile())
        .await
        .map_err(|e| reason::with_kind(reason::INTERNAL_KUBERNETES_CLIENT, e))?;
    let node_ssh = ssh_client(&ctl.cp.handle).await?;

    let mut api_tunnel = None;
    if driver::is_kic(&ctl.config.driver) && kic::external_daemon(&ctl.config.driver) {
        let local_port = ssh::free_local_port()?;
        let node = ctl.node("")?;
        let port = if node.port == 0 { ctl.config.api_server_port } else { node.port };
        let argv = node_ssh.forward(local_port, "127.0.0.1", port);
        let handle = ssh::api_server_tunnel(
            argv,
            local_port,
            settings.kubeconfig.clone(),
            ctl.profile().to_string(),
            token.child_token(),
        )
        .await
        .map_err(|e| reason::with_kind(reason::SVC_TUNNEL_START, e))?;
        out.step(Icon::Tunnel, format!("Forwarding the apiserver to 127.0.0.1:{}", local_port));
        api_tunnel = Some(handle);
    }

    let route = service_route(&ctl.config, &ctl.cp.ip);
    let status = StatusPatcher::new(client.clone());
    let (router, patcher): (Option<Router>, Box<dyn ServicePatcher>) = if driver::needs_port_forward(&ctl.config.driver) {
        out.step(
            Icon::Tunnel,
            "Services of type LoadBalancer are exposed on 127.0.0.1 through ssh",
        );
        (None, Box::new(ssh::SshServicePatcher::new(node_ssh, status)))
    } else {
        (Some(host_router()), Box::new(status))
    };

    let (tx, rx) = mpsc::channel(64);
    let watcher = tokio::spawn(tunnel::patcher::watch_services(client, tx));
    let machine = machine_name(&ctl.config, &ctl.node("")?);
    let ClusterController { cp, .. } = ctl;
    let mut lb = LoadBalancerTunnel::new(
        &machine,
        route,
        router,
        Registry::for_current_user(&settings.home),
        Box::new(cp.handle.driver),
        patcher,
        rx,
        out.clone(),
    )
    .spawn(token.clone());
    info!(%machine, "tunnel started");

    let res = lb.wait().await;
    watcher.abort();
    if let Some(mut h) = api_tunnel {
        if let Err(e) = h.stop().await {
            warn!(error = %e, "stopping apiserver forward");
        }
    }
    res.map_err(|e| reason::with_kind(reason::SVC_TUNNEL_STOP, e))
}

/// Flags of `minikube mount`.
#[derive(Clone, Debug, Default)]
pub struct MountOptions {
    pub mount_string: String,
    /// Address the guest dials, detected when empty.
    pub ip: String,
    pub port: u16,
    pub version: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub msize: Option<u32>,
    pub mode: Option<u32>,
    /// Extra `k=v,...` mount options.
    pub options: String,
    pub kill: bool,
}

/// The mount options of `cc` overridden by the command line.
pub fn mount_config(cc: &ClusterConfig, opts: &MountOptions) -> anyhow::Result<MountConfig> {
    let mut c = MountConfig::default();
    let pick = |flag: &Option<String>, saved: &str, default: String| {
        flag.clone()
            .or_else(|| Some(saved.to_string()).filter(|s| !s.is_empty()))
            .unwrap_or(default)
    };
    c.version = pick(&opts.version, &cc.mount_9p_version, c.version);
    c.uid = pick(&opts.uid, &cc.mount_uid, c.uid);
    c.gid = pick(&opts.gid, &cc.mount_gid, c.gid);
    c.msize = opts
        .msize
        .or(Some(cc.mount_msize).filter(|m| *m != 0))
        .unwrap_or(c.msize);
    if let Some(mode) = opts.mode {
        c.mode = mode;
    }
    c.port = opts.port;
    c.options = mount::parse_options(&opts.options)?;
    Ok(c)
}

/// `minikube mount`: serves the host directory until `token` is cancelled.
/// With `kill` it stops the mount process recorded for the profile instead.
pub async fn mount(settings: &Settings, opts: &MountOptions, token: CancellationToken) -> anyhow::Result<()> {
    let out = settings.out();
    if opts.kill {
        let killed = mount::kill_mount_process(&settings.home, &settings.profile).await?;
        if killed {
            out.step(Icon::Check, "Successfully killed the mount process");
        } else {
            out.step(Icon::Notice, "No mount process to kill");
        }
        return Ok(());
    }

    let (host_dir, target) = mount::parse_mount_string(&opts.mount_string)?;
    let ctl = ClusterController::load(settings).await?;
    if driver::bare_metal(&ctl.config.driver) {
        return Err(reason::usage("'none' driver does not support 'minikube mount' command"));
    }
    let config = mount_config(&ctl.config, opts)?;
    let runner = ctl.cp.handle.runner.clone();
    let ip: IpAddr = if opts.ip.is_empty() {
        mount::host_ip(&ctl.config.driver, &ctl.cp.ip, runner.as_ref()).await?
    } else {
        opts.ip
            .parse()
            .map_err(|_| reason::usage(format!("error parsing the input ip address for mount: {:?}", opts.ip)))?
    };
    let req = MountRequest {
        host_dir: host_dir.clone(),
        target: target.clone(),
        ip,
        bind_any: driver::is_kic(&ctl.config.driver),
        config,
    };
    out.step(
        Icon::Mount,
        format!("Mounting host path {} into VM as {} ...", host_dir.display(), target),
    );
    let mut m = Mount::start(&settings.home, ctl.profile(), runner, req, token)
        .await
        .map_err(|e| match reason::kind_of(&e) {
            Some(_) => e,
            None => reason::with_kind(reason::GUEST_MOUNT, e),
        })?;
    out.step(
        Icon::Check,
        format!("Successfully mounted {} to {} ({})", host_dir.display(), target, m.address),
    );
    out.step(Icon::Notice, "NOTE: This process must stay alive for the mount to be accessible ...");
    m.wait().await
}

/// Starts `minikube mount <mount_string>` as a detached child of this
/// process, logging to the profile's log directory.
pub async fn spawn_background_mount(settings: &Settings, mount_string: &str) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating the minikube binary")?;
    let logs = settings.home.logs_dir();
    tokio::fs::create_dir_all(&logs)
        .await
        .with_context(|| format!("creating {}", logs.display()))?;
    let log = std::fs::File::create(logs.join(format!("mount-{}.log", settings.profile)))
        .context("creating the mount log")?;
    let child = tokio::process::Command::new(&exe)
        .args(["-p", settings.profile.as_str(), "mount", mount_string])
        .env(crate::localpath::MINIKUBE_HOME, settings.home.root())
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .with_context(|| format!("starting {}", exe.display()))?;
    info!(pid = ?child.id(), %mount_string, "mount started in the background");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;
    use crate::localpath::MiniHome;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir.join(".minikube")));
        s.kubeconfig = dir.join("kubeconfig");
        s.output = crate::out::Format::Json;
        s
    }

    fn environ(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn unset_needs_no_cluster() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = EnvOptions {
            shell: "bash".to_string(),
            unset: true,
            ..Default::default()
        };
        let script = docker_env(&settings(dir.path()), &opts, &environ(&[])).await.expect("unset");
        assert!(script.contains("unset DOCKER_HOST;"));
        assert!(script.contains("unset MINIKUBE_ACTIVE_DOCKERD;"));

        let script = podman_env(&settings(dir.path()), &opts, &environ(&[])).await.expect("unset");
        assert!(script.contains("unset CONTAINER_HOST;"));

        let json = EnvOptions {
            shell: "none".to_string(),
            unset: true,
            output: "json".to_string(),
            ..Default::default()
        };
        let names = docker_env(&settings(dir.path()), &json, &environ(&[])).await.expect("json");
        assert!(names.starts_with("[\"DOCKER_TLS_VERIFY\""));
    }

    #[tokio::test]
    async fn incompatible_clusters_are_refused_before_connecting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let opts = EnvOptions {
            shell: "bash".to_string(),
            ..Default::default()
        };
        let none = cluster("minikube", "none", 0);
        settings.store().save("minikube", &none).await.expect("save");
        let err = docker_env(&settings, &opts, &environ(&[])).await.expect_err("none");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("ENV_DRIVER_CONFLICT"));

        let multi = cluster("minikube", "docker", 1);
        settings.store().save("minikube", &multi).await.expect("save");
        let err = docker_env(&settings, &opts, &environ(&[])).await.expect_err("multinode");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("ENV_MULTINODE_CONFLICT"));

        let docker = cluster("minikube", "kvm2", 0);
        settings.store().save("minikube", &docker).await.expect("save");
        let err = podman_env(&settings, &opts, &environ(&[])).await.expect_err("runtime");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("ENV_DRIVER_CONFLICT"));
    }

    #[test]
    fn tunnels_route_the_service_cidr() {
        let cc = cluster("minikube", "kvm2", 0);
        let route = service_route(&cc, "192.168.39.2");
        assert_eq!(route.dest_cidr, constants::DEFAULT_SERVICE_CIDR);
        assert_eq!(route.to_string(), format!("{} -> 192.168.39.2", constants::DEFAULT_SERVICE_CIDR));
    }

    #[test]
    fn mount_flags_override_the_profile() {
        let mut cc = cluster("minikube", "kvm2", 0);
        cc.mount_uid = "1000".to_string();
        let opts = MountOptions {
            gid: Some("0".to_string()),
            msize: Some(4096),
            options: "cache=mmap".to_string(),
            ..Default::default()
        };
        let c = mount_config(&cc, &opts).expect("config");
        assert_eq!(c.uid, "1000");
        assert_eq!(c.gid, "0");
        assert_eq!(c.msize, 4096);
        assert_eq!(c.version, "9p2000.L");
        assert_eq!(c.options.get("cache").map(String::as_str), Some("mmap"));
        assert!(mount_config(&cc, &MountOptions {
            options: "broken".to_string(),
            ..Default::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn killing_without_a_mount_is_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MountOptions {
            kill: true,
            ..Default::default()
        };
        mount(&settings(dir.path()), &opts, CancellationToken::new())
            .await
            .expect("kill");
    }
}
