//! The on-disk artifact cache.
//!
//! Artifacts are fetched once per home directory and reused by every
//! profile. Each download goes to `<dst>.part` and is renamed into place
//! only after its checksum verified, so a partially written file is never
//! mistaken for a cached one. Concurrent fetches of the same artifact are
//! serialized through a lock file next to the destination.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::backoff::{retry, ExponentialBackoffStrategy, RetryPolicy};
use crate::command::{Asset, Runner};
use crate::constants::{self, vmpath};
use crate::localpath::MiniHome;
use crate::lock::FileLock;
use crate::reason;

pub mod images;
pub mod preload;

const DOWNLOAD_ATTEMPTS: usize = 5;
const DOWNLOAD_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RELEASE_URL: &str = "https://dl.k8s.io/release";

/// The guest architecture name for the host's architecture.
pub fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    }
}

pub fn binary_url(version: &str, binary: &str) -> String {
    format!("{}/{}/bin/linux/{}/{}", RELEASE_URL, version, arch(), binary)
}

/// Where `binary` of Kubernetes `version` is cached.
pub fn binary_path(home: &MiniHome, version: &str, binary: &str) -> PathBuf {
    home.make(["cache", "linux", version, arch(), binary])
}

/// Where the ISO at `url` is cached. The directory is keyed by the URL so
/// that two ISOs with the same file name do not collide.
pub fn iso_path(home: &MiniHome, url: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    let name = url.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("minikube.iso");
    home.make(["cache", "iso", &digest[..16], name])
}

/// Fetches `url` into `dst` unless it is already there. When
/// `checksum_url` is given its first field is the expected hex SHA-256.
#[instrument(level = "info", skip(checksum_url), fields(dst = %dst.display()))]
pub async fn download(url: &str, dst: &Path, checksum_url: Option<&str>) -> anyhow::Result<()> {
    if tokio::fs::metadata(dst).await.is_ok() {
        debug!("already cached");
        return Ok(());
    }
    let dir = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", dst.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let _lock = FileLock::acquire(with_suffix(dst, ".lock"), DOWNLOAD_LOCK_TIMEOUT).await?;
    // Another process may have finished the same download while we waited.
    if tokio::fs::metadata(dst).await.is_ok() {
        return Ok(());
    }

    let client = reqwest::Client::new();
    let mut backoff = ExponentialBackoffStrategy::new(Duration::from_secs(1), Duration::from_secs(30));
    retry(url, &mut backoff, RetryPolicy::attempts(DOWNLOAD_ATTEMPTS), || {
        fetch(&client, url, dst, checksum_url)
    })
    .await?;
    info!(%url, "downloaded");
    Ok(())
}

async fn fetch(client: &reqwest::Client, url: &str, dst: &Path, checksum_url: Option<&str>) -> anyhow::Result<()> {
    let expected = match checksum_url {
        Some(c) => Some(fetch_checksum(client, c).await?),
        None => None,
    };
    let part = with_suffix(dst, ".part");
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()?;
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;
    let mut hasher = Sha256::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading {}", url))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = expected {
        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(&expected) {
            // Best effort: the next attempt truncates it anyway.
            let _ = tokio::fs::remove_file(&part).await;
            anyhow::bail!(
                "invalid checksum for {}: expected {}, got {}",
                url,
                expected,
                actual
            );
        }
    }
    tokio::fs::rename(&part, dst)
        .await
        .with_context(|| format!("renaming {} to {}", part.display(), dst.display()))
}

async fn fetch_checksum(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()?
        .text()
        .await?;
    body.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("empty checksum file at {}", url))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Caches one Kubernetes release binary and returns its path.
pub async fn cache_binary(home: &MiniHome, version: &str, binary: &str) -> anyhow::Result<PathBuf> {
    let dst = binary_path(home, version, binary);
    let url = binary_url(version, binary);
    let checksum = format!("{}{}", url, constants::SHA_SUFFIX);
    download(&url, &dst, Some(&checksum))
        .await
        .map_err(|e| reason::with_kind(reason::INET_CACHE_BINARIES, e))?;
    set_executable(&dst).await?;
    Ok(dst)
}

/// Caches kubelet, kubeadm and kubectl for `version` concurrently.
pub async fn cache_binaries(home: &MiniHome, version: &str) -> anyhow::Result<()> {
    futures::future::try_join_all(
        constants::KUBERNETES_RELEASE_BINARIES
            .iter()
            .map(|b| cache_binary(home, version, b)),
    )
    .await?;
    Ok(())
}

pub async fn cache_iso(home: &MiniHome, url: &str) -> anyhow::Result<PathBuf> {
    let dst = iso_path(home, url);
    let checksum = format!("{}{}", url, constants::SHA_SUFFIX);
    download(url, &dst, Some(&checksum))
        .await
        .map_err(|e| reason::with_kind(reason::INET_CACHE_BINARIES, e))?;
    Ok(dst)
}

/// Copies the cached release binaries into the guest at
/// `/var/lib/minikube/binaries/<version>`.
#[instrument(level = "info", skip(home, runner))]
pub async fn transfer_binaries(home: &MiniHome, version: &str, runner: &dyn Runner) -> anyhow::Result<()> {
    let dir = format!("{}/{}", vmpath::GUEST_BINARIES_DIR, version);
    for binary in constants::KUBERNETES_RELEASE_BINARIES.iter() {
        let src = cache_binary(home, version, binary).await?;
        runner
            .copy(&Asset::file(src, dir.clone(), *binary, "0755"))
            .await
            .with_context(|| format!("transferring {}", binary))?;
    }
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `bodies` in order, one per connection, over plain HTTP.
    async fn serve(bodies: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for body in bodies {
                let (mut sock, _) = listener.accept().await.expect("accept");
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                sock.write_all(head.as_bytes()).await.expect("head");
                sock.write_all(&body).await.expect("body");
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn download_verifies_checksum_and_renames() {
        let payload = b"kubelet".to_vec();
        let sum = format!("{:x}  kubelet\n", Sha256::digest(&payload));
        let base = serve(vec![sum.into_bytes(), payload.clone()]).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dst = dir.path().join("v1.28.0").join("kubelet");

        download(&format!("{}/kubelet", base), &dst, Some(&format!("{}/kubelet.sha256", base)))
            .await
            .expect("download");
        assert_eq!(tokio::fs::read(&dst).await.expect("read"), payload);
        assert!(!with_suffix(&dst, ".part").exists());
        assert!(!with_suffix(&dst, ".lock").exists());
    }

    #[tokio::test]
    async fn cached_artifacts_are_not_fetched_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dst = dir.path().join("kubeadm");
        tokio::fs::write(&dst, "cached").await.expect("write");
        download("http://127.0.0.1:1/never", &dst, None).await.expect("cached");
        assert_eq!(tokio::fs::read_to_string(&dst).await.expect("read"), "cached");
    }

    #[test]
    fn layout() {
        let home = MiniHome::new("/home/u/.minikube");
        let p = binary_path(&home, "v1.28.0", "kubectl");
        assert_eq!(
            p,
            PathBuf::from(format!("/home/u/.minikube/cache/linux/v1.28.0/{}/kubectl", arch()))
        );
        assert_eq!(
            binary_url("v1.28.0", "kubectl"),
            format!("https://dl.k8s.io/release/v1.28.0/bin/linux/{}/kubectl", arch())
        );

        let a = iso_path(&home, "https://a.example/minikube-v1.iso");
        let b = iso_path(&home, "https://b.example/minikube-v1.iso");
        assert_ne!(a, b);
        assert_eq!(a.file_name().and_then(|n| n.to_str()), Some("minikube-v1.iso"));
    }
}
