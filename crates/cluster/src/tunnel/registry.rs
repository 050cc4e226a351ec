//! The per-user list of running tunnels and the routes they own.
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::localpath::MiniHome;
use crate::lock::{pid_alive, FileLock};

use super::route::Route;

const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// One running tunnel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    pub route: Route,
    pub machine_name: String,
    pub pid: u32,
}

/// The numeric id of the current user.
#[cfg(unix)]
pub fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}

/// `<home>/tunnels.d/<uid>.json`. Tunnels of other users are never read.
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(home: &MiniHome, uid: u32) -> Self {
        Registry {
            path: home.tunnels_dir().join(format!("{}.json", uid)),
        }
    }

    pub fn for_current_user(home: &MiniHome) -> Self {
        Self::new(home, current_uid())
    }

    async fn lock(&self) -> anyhow::Result<FileLock> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        FileLock::acquire(self.path.with_extension("lock"), LOCK_TIMEOUT).await
    }

    async fn read(&self) -> anyhow::Result<Vec<Entry>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) if data.is_empty() => Ok(Vec::new()),
            Ok(data) => serde_json::from_slice(&data).with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn write(&self, entries: &[Entry]) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&self.path, data)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Entry>> {
        let _lock = self.lock().await?;
        self.read().await
    }

    /// Records `entry`. A live tunnel that already owns the same route is a
    /// conflict; a dead one is replaced.
    pub async fn register(&self, entry: Entry) -> anyhow::Result<()> {
        let _lock = self.lock().await?;
        let mut entries = self.read().await?;
        if let Some(existing) = entries.iter().find(|e| e.route == entry.route) {
            if existing.pid != entry.pid && pid_alive(existing.pid) {
                anyhow::bail!(
                    "another tunnel is already running for route {} (pid {}), try 'minikube tunnel --cleanup'",
                    entry.route,
                    existing.pid
                );
            }
        }
        entries.retain(|e| e.route != entry.route);
        debug!(route = %entry.route, pid = entry.pid, "registering tunnel");
        entries.push(entry);
        self.write(&entries).await
    }

    /// Forgets the tunnel owning `route`.
    pub async fn remove(&self, route: &Route) -> anyhow::Result<()> {
        let _lock = self.lock().await?;
        let mut entries = self.read().await?;
        let before = entries.len();
        entries.retain(|e| &e.route != route);
        if entries.len() != before {
            self.write(&entries).await?;
        }
        Ok(())
    }

    /// Removes and returns every entry whose process has exited.
    pub async fn take_stale(&self) -> anyhow::Result<Vec<Entry>> {
        let _lock = self.lock().await?;
        let entries = self.read().await?;
        let (stale, live): (Vec<Entry>, Vec<Entry>) = entries.into_iter().partition(|e| !pid_alive(e.pid));
        if !stale.is_empty() {
            info!(count = stale.len(), "found tunnels left behind by exited processes");
            self.write(&live).await?;
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn route(gw: &str) -> Route {
        Route {
            gateway: gw.to_string(),
            dest_cidr: "10.96.0.0/12".to_string(),
        }
    }

    #[tokio::test]
    async fn entries_are_per_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let mine = Registry::new(&home, 1000);
        let theirs = Registry::new(&home, 1001);
        mine.register(Entry {
            route: route("192.168.39.2"),
            machine_name: "minikube".to_string(),
            pid: std::process::id(),
        })
        .await
        .expect("register");
        assert_eq!(mine.list().await.expect("list").len(), 1);
        assert!(theirs.list().await.expect("list").is_empty());
        assert!(dir.path().join("tunnels.d").join("1000.json").exists());

        let raw = std::fs::read_to_string(dir.path().join("tunnels.d/1000.json")).expect("read");
        assert!(raw.contains("\"DestCIDR\": \"10.96.0.0/12\""));
        assert!(raw.contains("\"MachineName\": \"minikube\""));
    }

    #[tokio::test]
    async fn live_owners_conflict_and_dead_ones_are_reaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Registry::new(&MiniHome::new(dir.path()), 1000);
        let live = Entry {
            route: route("192.168.39.2"),
            machine_name: "minikube".to_string(),
            pid: std::process::id(),
        };
        reg.register(live.clone()).await.expect("register");
        let rival = Entry {
            pid: std::process::id() + 1_000_000,
            ..live.clone()
        };
        // Our own pid is alive, so a second tunnel for the route is refused.
        assert!(reg.register(rival).await.is_err());

        let dead = Entry {
            route: route("192.168.49.2"),
            machine_name: "p2".to_string(),
            pid: i32::MAX as u32 - 1,
        };
        reg.register(dead.clone()).await.expect("register");
        let stale = reg.take_stale().await.expect("stale");
        assert_eq!(stale, vec![dead]);
        assert_eq!(reg.list().await.expect("list"), vec![live.clone()]);

        reg.remove(&live.route).await.expect("remove");
        assert!(reg.list().await.expect("list").is_empty());
    }
}
