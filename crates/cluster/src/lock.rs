//! Cooperative lock files.
//!
//! A lock is a file linked into place next to the resource it guards, so it
//! is never visible without its contents: `<pid> <unix time>` of the owner.
//! A lock whose owner is gone, or whose pid now belongs to a process started
//! after the lock was taken, is stale and is taken over. A lock that cannot
//! be parsed is treated as held until it is older than [`UNPARSED_GRACE`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long an unreadable lock file is respected before it is taken over.
pub const UNPARSED_GRACE: Duration = Duration::from_secs(10);

/// Clock skew allowed between a lock's timestamp and its owner's start time.
const START_TIME_SLACK: i64 = 2;

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Owner {
    Live(u32),
    Stale,
}

impl FileLock {
    /// Acquires the lock at `path`, waiting up to `timeout` for a live owner
    /// to release it.
    pub async fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> anyhow::Result<FileLock> {
        Self::acquire_with_grace(path, timeout, UNPARSED_GRACE).await
    }

    async fn acquire_with_grace(path: impl Into<PathBuf>, timeout: Duration, grace: Duration) -> anyhow::Result<FileLock> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let started = Instant::now();
        loop {
            match try_create(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired lock");
                    return Ok(FileLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("creating lock {}", path.display()))
                }
            }

            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                // Released between our attempt and the read.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(_) => String::new(),
            };
            match owner_state(&path, &contents, grace).await {
                Owner::Live(pid) => {
                    if started.elapsed() >= timeout {
                        anyhow::bail!(
                            "timed out after {:?} waiting for lock {} held by pid {}",
                            timeout,
                            path.display(),
                            pid
                        );
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Owner::Stale => {
                    warn!(path = %path.display(), owner = %contents.trim(), "taking over stale lock");
                    take_over(&path, &contents).await?;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "unable to release lock");
            }
        }
    }
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{}.{}", std::process::id(), uuid::Uuid::new_v4().to_simple(), suffix));
    path.with_file_name(name)
}

/// Writes the owner line to a private file and links it into place, which
/// fails with `AlreadyExists` when the lock is held.
async fn try_create(path: &Path) -> std::io::Result<()> {
    let tmp = side_file(path, "tmp");
    let owner = format!("{} {}", std::process::id(), chrono::Utc::now().timestamp());
    tokio::fs::write(&tmp, owner.as_bytes()).await?;
    let res = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    res
}

/// Moves a stale lock aside. When the file turns out to have changed since
/// it was judged stale, it belongs to a new owner and is put back.
async fn take_over(path: &Path, judged: &str) -> anyhow::Result<()> {
    let tomb = side_file(path, "stale");
    match tokio::fs::rename(path, &tomb).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("removing stale lock {}", path.display())),
    }
    let moved = tokio::fs::read_to_string(&tomb).await.unwrap_or_default();
    if moved != judged {
        debug!(path = %path.display(), "lock changed hands while taking it over, restoring it");
        match tokio::fs::hard_link(&tomb, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => warn!(path = %path.display(), error = %e, "unable to restore lock"),
        }
    }
    let _ = tokio::fs::remove_file(&tomb).await;
    Ok(())
}

fn parse_owner(contents: &str) -> Option<(u32, i64)> {
    let mut fields = contents.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let taken = fields.next()?.parse().ok()?;
    Some((pid, taken))
}

async fn owner_state(path: &Path, contents: &str, grace: Duration) -> Owner {
    match parse_owner(contents) {
        Some((pid, taken)) => {
            let reused = process_start_time(pid).map_or(false, |s| s > taken + START_TIME_SLACK);
            if pid_alive(pid) && !reused {
                Owner::Live(pid)
            } else {
                Owner::Stale
            }
        }
        None => {
            let age = tokio::fs::metadata(path)
                .await
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            match age {
                Some(age) if age < grace => Owner::Live(0),
                // Unknown age: the file vanished or its clock is ahead.
                None => Owner::Live(0),
                Some(_) => Owner::Stale,
            }
        }
    }
}

/// Start time of a process in unix seconds, where the platform reports it.
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<i64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the parenthesised command name start at field 3.
    let rest = &stat[stat.rfind(')')? + 1..];
    let ticks: i64 = rest.split_whitespace().nth(19)?.parse().ok()?;
    let boot: i64 = std::fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|l| l.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    Some(boot + ticks / hz as i64)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<i64> {
    None
}

/// Reports whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Reports whether a process with this pid exists.
#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("p").join(".lock");
        {
            let lock = FileLock::acquire(&path, Duration::from_secs(1))
                .await
                .expect("acquire");
            assert!(lock.path().exists());
            let contents = std::fs::read_to_string(&path).expect("read lock");
            assert!(contents.starts_with(&std::process::id().to_string()));
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_owner_blocks_until_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let _held = FileLock::acquire(&path, Duration::from_secs(1))
            .await
            .expect("acquire");
        let err = FileLock::acquire(&path, Duration::from_millis(250))
            .await
            .expect_err("second acquire should time out");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        // pid 0 is never a live owner.
        std::fs::write(&path, "0 1").expect("write stale lock");
        let _lock = FileLock::acquire(&path, Duration::from_millis(250))
            .await
            .expect("stale lock should be taken over");
        let contents = std::fs::read_to_string(&path).expect("read lock");
        assert!(contents.starts_with(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn unparsed_lock_is_held_until_it_ages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        std::fs::write(&path, "").expect("write empty lock");
        let err = FileLock::acquire(&path, Duration::from_millis(300))
            .await
            .expect_err("a fresh empty lock is held");
        assert!(err.to_string().contains("timed out"));
        assert!(path.exists());

        std::fs::write(&path, "not a pid").expect("write garbage lock");
        tokio::time::sleep(Duration::from_millis(150)).await;
        FileLock::acquire_with_grace(&path, Duration::from_secs(1), Duration::from_millis(100))
            .await
            .expect("an old garbage lock is taken over");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reused_pid_does_not_keep_a_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        // This process is alive, but started long after the lock was taken.
        std::fs::write(&path, format!("{} 1", std::process::id())).expect("write lock");
        FileLock::acquire(&path, Duration::from_millis(250))
            .await
            .expect("lock of a reused pid is taken over");
        assert!(process_start_time(std::process::id()).expect("start time") > 1);
    }

    #[tokio::test]
    async fn takeover_restores_a_lock_that_changed_hands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let fresh = format!("{} {}", std::process::id(), chrono::Utc::now().timestamp());
        std::fs::write(&path, &fresh).expect("write lock");
        take_over(&path, "0 1").await.expect("take over");
        assert_eq!(std::fs::read_to_string(&path).expect("read lock"), fresh);
        let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }
}
