//! Sharing a host directory with the guest over 9p.
//!
//! The host side is an in-process [`ninep::Server`]; the guest mounts it
//! with the kernel's 9p client over TCP. The serving process records its
//! pid so that `mount --kill` can stop it from another shell.
use std::collections::BTreeMap;
use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use tracing_futures::Instrument;

use crate::command::{shell_quote, Cmd, Runner};
use crate::constants;
use crate::driver;
use crate::handle::{StopHandler, TaskHandle};
use crate::localpath::MiniHome;
use crate::lock::pid_alive;
use crate::reason;

pub const DEFAULT_MODE: u32 = 0o755;

/// Options of a 9p mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountConfig {
    pub fs_type: String,
    /// User or numeric uid owning files in the guest.
    pub uid: String,
    pub gid: String,
    pub version: String,
    pub msize: u32,
    pub mode: u32,
    pub port: u16,
    /// Extra `-o` options, e.g. `cache=mmap`.
    pub options: BTreeMap<String, String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_type: "9p".to_string(),
            uid: "docker".to_string(),
            gid: "docker".to_string(),
            version: "9p2000.L".to_string(),
            msize: ninep::DEFAULT_MSIZE,
            mode: DEFAULT_MODE,
            port: 0,
            options: BTreeMap::new(),
        }
    }
}

/// Splits `<host dir>:<guest dir>`. A Windows drive letter stays with the
/// host side.
pub fn parse_mount_string(s: &str) -> anyhow::Result<(PathBuf, String)> {
    let (host, guest) = s
        .rsplit_once(':')
        .filter(|(h, _)| !h.is_empty())
        .ok_or_else(|| reason::usage(format!("mount argument {:?} must be of the form <source directory>:<target directory>", s)))?;
    if !guest.starts_with('/') {
        return Err(reason::usage(format!(
            "target directory {:?} must be an absolute path",
            guest
        )));
    }
    Ok((PathBuf::from(host), guest.to_string()))
}

/// Parses `--options` of the form `k=v,k2=v2`.
pub fn parse_options(s: &str) -> anyhow::Result<BTreeMap<String, String>> {
    s.split(',')
        .filter(|kv| !kv.trim().is_empty())
        .map(|kv| {
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| reason::usage(format!("mount option {:?} must be of the form key=value", kv)))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn resolve_uid(uid: &str) -> String {
    if uid.parse::<u32>().is_ok() {
        uid.to_string()
    } else {
        format!("$(id -u {})", uid)
    }
}

fn resolve_gid(gid: &str) -> String {
    if gid.parse::<u32>().is_ok() {
        gid.to_string()
    } else {
        format!("$(grep ^{}: /etc/group | cut -d: -f3)", gid)
    }
}

/// The guest command that mounts `source` at `target`.
pub fn mount_command(source: &str, target: &str, c: &MountConfig) -> String {
    let mut options = BTreeMap::new();
    options.insert("dfltgid".to_string(), resolve_gid(&c.gid));
    options.insert("dfltuid".to_string(), resolve_uid(&c.uid));
    if c.port != 0 {
        options.insert("port".to_string(), c.port.to_string());
    }
    if !c.version.is_empty() {
        options.insert("version".to_string(), c.version.clone());
    }
    if c.msize != 0 {
        options.insert("msize".to_string(), c.msize.to_string());
    }
    options.insert("trans".to_string(), "tcp".to_string());
    for (k, v) in &c.options {
        options.insert(k.clone(), v.clone());
    }
    let opts: Vec<String> = options.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(
        "sudo mount -t {} -o {} {} {}",
        c.fs_type,
        opts.join(","),
        source,
        shell_quote(target)
    )
}

/// Unmounts `target` if anything is mounted there.
pub fn unmount_command(target: &str) -> String {
    let t = shell_quote(target);
    format!(
        "[ \"x$(findmnt -T {t} | grep {t})\" != \"x\" ] && sudo umount -f -l {t} || echo ",
        t = t
    )
}

/// Mounts the host's 9p export inside the guest, replacing any earlier mount.
#[instrument(level = "info", skip(runner, c))]
pub async fn mount_in_guest(runner: &dyn Runner, source: &str, target: &str, c: &MountConfig) -> anyhow::Result<()> {
    runner
        .run(Cmd::shell(unmount_command(target)))
        .await
        .context("unmounting previous mount")?;
    runner
        .run(Cmd::sudo("mkdir").args(["-m", &format!("{:o}", c.mode), "-p", target]))
        .await
        .context("creating mount point")?;
    runner
        .run(Cmd::shell(mount_command(source, target, c)))
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_MOUNT, e))?;
    info!("mounted");
    Ok(())
}

/// The address of this host as seen by the guest at `guest_ip`.
///
/// Container nodes resolve the host through their hosts file; otherwise the
/// local address of the route towards the guest is used.
pub async fn host_ip(driver_name: &str, guest_ip: &str, runner: &dyn Runner) -> anyhow::Result<IpAddr> {
    let found = if driver::is_kic(driver_name) {
        let out = runner
            .run(Cmd::shell(format!(
                "grep {} /etc/hosts | cut -f1",
                constants::HOST_ALIAS
            )))
            .await?
            .stdout_str();
        out.trim()
            .lines()
            .next()
            .unwrap_or_default()
            .parse::<IpAddr>()
            .with_context(|| format!("no address for {} in the guest", constants::HOST_ALIAS))
    } else {
        route_source(guest_ip)
    };
    found.map_err(|e| reason::with_kind(reason::IF_MOUNT_IP, e))
}

fn route_source(guest_ip: &str) -> anyhow::Result<IpAddr> {
    let target: IpAddr = guest_ip
        .parse()
        .with_context(|| format!("invalid guest address {:?}", guest_ip))?;
    let bind: IpAddr = if target.is_ipv4() {
        [0, 0, 0, 0].into()
    } else {
        std::net::Ipv6Addr::UNSPECIFIED.into()
    };
    // Connecting a UDP socket sends nothing; it only selects a route.
    let socket = UdpSocket::bind((bind, 0))?;
    socket.connect((target, 9))?;
    Ok(socket.local_addr()?.ip())
}

async fn write_pid(path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, std::process::id().to_string())
        .await
        .with_context(|| format!("writing {}", path.display()))
        .map_err(|e| reason::with_kind(reason::HOST_MOUNT_PID, e))
}

/// Stops the mount process recorded for `profile`. Returns whether one was
/// running.
pub async fn kill_mount_process(home: &MiniHome, profile: &str) -> anyhow::Result<bool> {
    let path = home.mount_pid(profile);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no mount pid file");
            return Ok(false);
        }
        Err(e) => {
            return Err(reason::with_kind(
                reason::HOST_KILL_MOUNT_PROC,
                anyhow::Error::new(e).context(format!("reading {}", path.display())),
            ))
        }
    };
    let pid: u32 = raw.trim().parse().map_err(|_| {
        reason::with_kind(
            reason::HOST_KILL_MOUNT_PROC,
            anyhow::anyhow!("{} holds an invalid pid {:?}", path.display(), raw.trim()),
        )
    })?;
    let alive = pid_alive(pid);
    if alive {
        terminate(pid).map_err(|e| reason::with_kind(reason::HOST_KILL_MOUNT_PROC, e))?;
        info!(pid, "stopped mount process");
    }
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("removing {}", path.display()))?;
    Ok(alive)
}

#[cfg(unix)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("signalling pid {}", pid));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> anyhow::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()?;
    if !status.success() {
        anyhow::bail!("taskkill {} failed: {}", pid, status);
    }
    Ok(())
}

/// What to share and where.
#[derive(Clone, Debug)]
pub struct MountRequest {
    pub host_dir: PathBuf,
    pub target: String,
    /// Address the guest dials.
    pub ip: IpAddr,
    /// Listen on every interface rather than only `ip`, for guests that
    /// reach the host through a NAT.
    pub bind_any: bool,
    pub config: MountConfig,
}

/// A running mount. Stopping it unmounts in the guest, shuts the server
/// down and removes the pid file.
pub struct Mount {
    pub address: std::net::SocketAddr,
    handle: TaskHandle,
}

impl Mount {
    /// Serves `req.host_dir` and mounts it at `req.target` in the guest.
    pub async fn start(
        home: &MiniHome,
        profile: &str,
        runner: Arc<dyn Runner>,
        req: MountRequest,
        token: CancellationToken,
    ) -> anyhow::Result<Mount> {
        let MountRequest {
            host_dir,
            target,
            ip,
            bind_any,
            mut config,
        } = req;
        if !host_dir.is_dir() {
            return Err(reason::with_kind(
                reason::HOST_PATH_MISSING,
                anyhow::anyhow!("cannot find directory {} for mount", host_dir.display()),
            ));
        }
        let bind_ip: IpAddr = if bind_any { [0, 0, 0, 0].into() } else { ip };
        let listener = TcpListener::bind((bind_ip, config.port)).await.map_err(|e| {
            reason::with_kind(
                reason::IF_MOUNT_PORT,
                anyhow::Error::new(e).context(format!("binding {}:{}", bind_ip, config.port)),
            )
        })?;
        let address = listener.local_addr()?;
        config.port = address.port();

        let pid_file = home.mount_pid(profile);
        write_pid(&pid_file).await?;

        let server = ninep::Server::new(&host_dir).with_msize(config.msize);
        let server_token = token.child_token();
        let span = tracing::info_span!("mount", root = %host_dir.display());
        let serving = tokio::spawn(
            {
                let server_token = server_token.clone();
                async move { server.serve(listener, server_token).await }
            }
            .instrument(span),
        );
        info!(%address, "9p server listening");

        if let Err(e) = mount_in_guest(runner.as_ref(), &ip.to_string(), &target, &config).await {
            server_token.cancel();
            let _ = tokio::fs::remove_file(&pid_file).await;
            return Err(e);
        }

        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            cancelled.cancelled().await;
            if let Err(e) = runner.run(Cmd::shell(unmount_command(&target))).await {
                warn!(error = %e, %target, "unmounting");
            }
            server_token.cancel();
            match serving.await {
                Ok(res) => res?,
                Err(e) => warn!(error = %e, "9p server task failed"),
            }
            let _ = tokio::fs::remove_file(&pid_file).await;
            info!("mount stopped");
            Ok(())
        });
        Ok(Mount {
            address,
            handle: TaskHandle::new(token, task),
        })
    }
}

#[async_trait::async_trait]
impl StopHandler for Mount {
    async fn stop(&mut self) -> anyhow::Result<()> {
        self.handle.stop().await
    }

    async fn wait(&mut self) -> anyhow::Result<()> {
        self.handle.wait().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn mount_strings_split_at_the_last_colon() {
        let (host, guest) = parse_mount_string("/home/me/src:/src").expect("parse");
        assert_eq!(host, PathBuf::from("/home/me/src"));
        assert_eq!(guest, "/src");
        let (host, _) = parse_mount_string("C:\\Users\\me:/data").expect("parse");
        assert_eq!(host, PathBuf::from("C:\\Users\\me"));
        assert!(parse_mount_string("/only-host").is_err());
        assert!(parse_mount_string("/h:relative").is_err());
        assert!(parse_mount_string(":/x").is_err());
    }

    #[test]
    fn options_are_sorted_and_names_resolved_in_the_guest() {
        let config = MountConfig {
            port: 40301,
            ..Default::default()
        };
        assert_eq!(
            mount_command("192.168.49.1", "/src", &config),
            "sudo mount -t 9p -o dfltgid=$(grep ^docker: /etc/group | cut -d: -f3),dfltuid=$(id -u docker),msize=262144,port=40301,trans=tcp,version=9p2000.L 192.168.49.1 /src"
        );
        let numeric = MountConfig {
            uid: "1000".to_string(),
            gid: "1000".to_string(),
            port: 5000,
            options: parse_options("cache=mmap,version=9p2000.u").expect("options"),
            ..Default::default()
        };
        assert_eq!(
            mount_command("10.0.0.1", "/d", &numeric),
            "sudo mount -t 9p -o cache=mmap,dfltgid=1000,dfltuid=1000,msize=262144,port=5000,trans=tcp,version=9p2000.u 10.0.0.1 /d"
        );
        assert!(parse_options("cache").is_err());
    }

    #[tokio::test]
    async fn kic_guests_resolve_the_host_alias() {
        let runner = FakeRunner::default().respond("host.minikube.internal", "192.168.49.1\n", 0);
        let ip = host_ip("docker", "192.168.49.2", &runner).await.expect("ip");
        assert_eq!(ip.to_string(), "192.168.49.1");
        let empty = FakeRunner::default();
        let err = host_ip("docker", "192.168.49.2", &empty).await.expect_err("missing");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("IF_MOUNT_IP"));
        let local = host_ip("kvm2", "127.0.0.1", &empty).await.expect("route");
        assert!(local.is_loopback());
    }

    #[tokio::test]
    async fn mount_serves_then_unmounts_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path().join(".minikube"));
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).expect("mkdir");
        let runner = Arc::new(FakeRunner::default());
        let req = MountRequest {
            host_dir: shared,
            target: "/mnt/shared".to_string(),
            ip: [127, 0, 0, 1].into(),
            bind_any: false,
            config: MountConfig::default(),
        };
        let mut mount = Mount::start(&home, "p1", runner.clone(), req, CancellationToken::new())
            .await
            .expect("start");
        let pid = std::fs::read_to_string(home.mount_pid("p1")).expect("pid file");
        assert_eq!(pid, std::process::id().to_string());
        assert!(std::net::TcpStream::connect(mount.address).is_ok());
        let commands = runner.commands();
        let mounted = commands
            .iter()
            .find(|c| c.contains("mount -t 9p"))
            .expect("mount command");
        assert!(mounted.contains(&format!("port={}", mount.address.port())));
        assert!(commands.iter().any(|c| c.contains("mkdir -m 755 -p /mnt/shared")));

        mount.stop().await.expect("stop");
        mount.wait().await.expect("wait");
        assert!(!home.mount_pid("p1").exists());
        assert!(runner.commands().iter().filter(|c| c.contains("umount -f -l")).count() >= 2);
    }

    #[tokio::test]
    async fn missing_host_dirs_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let req = MountRequest {
            host_dir: dir.path().join("nope"),
            target: "/x".to_string(),
            ip: [127, 0, 0, 1].into(),
            bind_any: false,
            config: MountConfig::default(),
        };
        let err = Mount::start(&home, "p1", Arc::new(FakeRunner::default()), req, CancellationToken::new())
            .await
            .err()
            .expect("missing dir");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("HOST_PATH_MISSING"));
    }

    #[tokio::test]
    async fn kill_reaps_stale_pid_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        assert!(!kill_mount_process(&home, "p1").await.expect("no file"));
        let path = home.mount_pid("p1");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "4194303").expect("write");
        assert!(!kill_mount_process(&home, "p1").await.expect("dead pid"));
        assert!(!path.exists());
        std::fs::write(&path, "garbage").expect("write");
        let err = kill_mount_process(&home, "p1").await.expect_err("bad pid");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("HOST_KILL_MOUNT_PROC"));
    }
}
