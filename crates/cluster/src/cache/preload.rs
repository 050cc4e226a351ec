//! Preloaded image tarballs.
//!
//! A preload holds the extracted image store of a runtime with every image
//! kubeadm needs for one Kubernetes version. Extracting it in the guest
//! replaces pulling the control plane images one by one.
use std::path::PathBuf;

use tracing::{info, instrument, warn};

use super::{arch, download};
use crate::command::{Asset, Runner};
use crate::cruntime::{Manager, RuntimeKind};
use crate::localpath::MiniHome;
use crate::reason;

const PRELOAD_VERSION: &str = "v18";
const BUCKET: &str = "https://storage.googleapis.com/minikube-preloaded-volume-tarballs";
const GUEST_TARBALL: &str = "/preloaded.tar.lz4";

pub fn tarball_name(k8s_version: &str, runtime: RuntimeKind) -> String {
    let storage = match runtime {
        RuntimeKind::Crio => "overlay",
        _ => "overlay2",
    };
    format!(
        "preloaded-images-k8s-{}-{}-{}-{}-{}.tar.lz4",
        PRELOAD_VERSION,
        k8s_version,
        runtime.name(),
        storage,
        arch()
    )
}

pub fn tarball_path(home: &MiniHome, k8s_version: &str, runtime: RuntimeKind) -> PathBuf {
    home.make(["cache", "preloaded-tarball", &tarball_name(k8s_version, runtime)])
}

pub fn remote_url(k8s_version: &str, runtime: RuntimeKind) -> String {
    format!(
        "{}/{}/{}/{}",
        BUCKET,
        PRELOAD_VERSION,
        k8s_version,
        tarball_name(k8s_version, runtime)
    )
}

/// Whether a preload can exist for this combination at all.
pub fn supported(k8s_version: &str) -> bool {
    match semver::Version::parse(k8s_version.trim_start_matches('v')) {
        Ok(v) => v >= semver::Version::new(1, 16, 0) && v.pre.is_empty(),
        Err(_) => false,
    }
}

pub async fn exists(home: &MiniHome, k8s_version: &str, runtime: RuntimeKind) -> bool {
    tokio::fs::metadata(tarball_path(home, k8s_version, runtime)).await.is_ok()
}

/// Fetches the preload into the cache. Returns false when none is
/// published for this version.
#[instrument(level = "info", skip(home))]
pub async fn cache_preload(home: &MiniHome, k8s_version: &str, runtime: RuntimeKind) -> anyhow::Result<bool> {
    if !supported(k8s_version) {
        return Ok(false);
    }
    if exists(home, k8s_version, runtime).await {
        return Ok(true);
    }
    let url = remote_url(k8s_version, runtime);
    match reqwest::Client::new().head(&url).send().await {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            info!(%url, status = %resp.status(), "no preload published");
            return Ok(false);
        }
        Err(e) => {
            warn!(%url, error = %e, "unable to check for preload");
            return Ok(false);
        }
    }
    download(&url, &tarball_path(home, k8s_version, runtime), None)
        .await
        .map_err(|e| reason::with_kind(reason::INET_CACHE_TAR, e))?;
    Ok(true)
}

/// Copies the cached preload into the guest and extracts it into the
/// runtime's image store. Returns false when no preload is cached.
#[instrument(level = "info", skip_all, fields(runtime = %manager.kind()))]
pub async fn load(home: &MiniHome, k8s_version: &str, runner: &dyn Runner, manager: &dyn Manager) -> anyhow::Result<bool> {
    let path = tarball_path(home, k8s_version, manager.kind());
    if tokio::fs::metadata(&path).await.is_err() {
        return Ok(false);
    }
    runner
        .copy(&Asset::file(path, "/", GUEST_TARBALL.trim_start_matches('/'), "0644"))
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
    manager
        .preload(GUEST_TARBALL)
        .await
        .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
    info!("extracted preloaded images");
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;
    use crate::cruntime::new_runtime;
    use std::sync::Arc;

    #[test]
    fn naming() {
        assert_eq!(
            tarball_name("v1.28.0", RuntimeKind::Docker),
            format!("preloaded-images-k8s-v18-v1.28.0-docker-overlay2-{}.tar.lz4", arch())
        );
        assert!(remote_url("v1.28.0", RuntimeKind::Containerd).starts_with(
            "https://storage.googleapis.com/minikube-preloaded-volume-tarballs/v18/v1.28.0/"
        ));
        assert!(supported("v1.28.0"));
        assert!(!supported("v1.29.0-rc.1"));
        assert!(!supported("latest"));
    }

    #[tokio::test]
    async fn load_extracts_into_the_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let runner = Arc::new(FakeRunner::default());
        let manager = new_runtime(RuntimeKind::Docker, runner.clone(), "v1.28.0");

        assert!(!load(&home, "v1.28.0", runner.as_ref(), manager.as_ref()).await.expect("no preload"));

        let path = tarball_path(&home, "v1.28.0", RuntimeKind::Docker);
        tokio::fs::create_dir_all(path.parent().expect("parent")).await.expect("mkdir");
        tokio::fs::write(&path, b"lz4").await.expect("write");
        assert!(load(&home, "v1.28.0", runner.as_ref(), manager.as_ref()).await.expect("load"));
        let seen = runner.commands();
        assert!(seen.iter().any(|c| c.contains("tee /preloaded.tar.lz4")));
        assert!(seen.iter().any(|c| c.contains("tar") && c.contains("/preloaded.tar.lz4")));
    }
}
