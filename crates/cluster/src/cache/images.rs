//! Container images saved as tarballs on the host and loaded into guests.
use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use super::{arch, with_suffix, DOWNLOAD_LOCK_TIMEOUT};
use crate::command::{Asset, Cmd, ExecRunner, Runner};
use crate::config::user::{UserConfig, CACHE};
use crate::constants::vmpath;
use crate::cruntime::Manager;
use crate::localpath::{sanitize_cache_dir, MiniHome};
use crate::lock::FileLock;
use crate::reason;

/// Where the tarball of `image` is cached.
pub fn image_path(home: &MiniHome, image: &str) -> PathBuf {
    let mut p = home.make(["cache", "images", arch()]);
    for part in sanitize_cache_dir(image).split('/') {
        p.push(part);
    }
    p
}

fn guest_path(image: &str) -> String {
    let name = sanitize_cache_dir(image);
    let base = name.rsplit('/').next().unwrap_or(&name);
    format!("{}/{}", vmpath::GUEST_IMAGES_DIR, base)
}

/// The container CLI on the host used to pull and save images.
fn host_cli() -> anyhow::Result<&'static str> {
    ["docker", "podman"]
        .iter()
        .copied()
        .find(|b| which::which(b).is_ok())
        .ok_or_else(|| anyhow::anyhow!("neither docker nor podman is available to save images"))
}

/// Pulls `image` on the host and saves it into the cache.
#[instrument(level = "info", skip(home))]
pub async fn cache_image(home: &MiniHome, image: &str) -> anyhow::Result<PathBuf> {
    let dst = image_path(home, image);
    if tokio::fs::metadata(&dst).await.is_ok() {
        return Ok(dst);
    }
    if let Some(dir) = dst.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let _lock = FileLock::acquire(with_suffix(&dst, ".lock"), DOWNLOAD_LOCK_TIMEOUT).await?;
    if tokio::fs::metadata(&dst).await.is_ok() {
        return Ok(dst);
    }
    let cli = host_cli()?;
    let host = ExecRunner::new();
    let part = with_suffix(&dst, ".part");
    host.run(Cmd::new(cli).args(["pull", image]))
        .await
        .with_context(|| format!("pulling {}", image))?;
    host.run(Cmd::new(cli).arg("save").arg("-o").arg(part.display().to_string()).arg(image))
        .await
        .with_context(|| format!("saving {}", image))?;
    tokio::fs::rename(&part, &dst)
        .await
        .with_context(|| format!("renaming {}", part.display()))?;
    info!(path = %dst.display(), "cached image");
    Ok(dst)
}

/// Caches every image, stopping at the first failure.
pub async fn cache_images(home: &MiniHome, images: &[String]) -> anyhow::Result<()> {
    for image in images {
        cache_image(home, image)
            .await
            .map_err(|e| reason::with_kind(reason::INET_CACHE_TAR, e))?;
    }
    Ok(())
}

/// Copies the cached tarballs of `images` into the guest and loads them
/// into its runtime.
#[instrument(level = "info", skip_all, fields(count = images.len()))]
pub async fn load_cached_images(home: &MiniHome, runner: &dyn Runner, manager: &dyn Manager, images: &[String]) -> anyhow::Result<()> {
    for image in images {
        let src = cache_image(home, image).await?;
        let dst = guest_path(image);
        let (dir, name) = dst.rsplit_once('/').unwrap_or((vmpath::GUEST_IMAGES_DIR, dst.as_str()));
        runner
            .copy(&Asset::file(src, dir, name, "0644"))
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
        manager
            .load_image(&dst)
            .await
            .with_context(|| format!("loading {}", image))
            .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
        debug!(%image, "loaded image");
    }
    Ok(())
}

/// Removes `images` from the guest runtime. Missing images are skipped.
pub async fn remove_images(manager: &dyn Manager, images: &[String]) -> anyhow::Result<()> {
    for image in images {
        if let Err(e) = manager.remove_image(image).await {
            warn!(%image, error = %e, "unable to remove image");
        }
    }
    Ok(())
}

/// Deletes the cached tarballs of `images`.
pub async fn delete_cached(home: &MiniHome, images: &[String]) -> anyhow::Result<()> {
    for image in images {
        let path = image_path(home, image);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(reason::with_kind(
                    reason::HOST_DEL_CACHE,
                    anyhow::Error::new(e).context(format!("removing {}", path.display())),
                ))
            }
        }
    }
    Ok(())
}

/// Adds `images` to the user-wide cached image set.
pub async fn add_to_cache_list(home: &MiniHome, images: &[String]) -> anyhow::Result<BTreeSet<String>> {
    UserConfig::update(home, |cfg| {
        cfg.add_to_map(CACHE, images.iter().cloned());
        Ok(cfg.cached_images())
    })
    .await
}

/// Removes `images` from the user-wide cached image set.
pub async fn delete_from_cache_list(home: &MiniHome, images: &[String]) -> anyhow::Result<BTreeSet<String>> {
    UserConfig::update(home, |cfg| {
        cfg.delete_from_map(CACHE, images.iter().map(String::as_str));
        Ok(cfg.cached_images())
    })
    .await
}

/// The user-wide cached image set.
pub async fn cache_list(home: &MiniHome) -> anyhow::Result<BTreeSet<String>> {
    Ok(UserConfig::read(&home.config_file()).await?.cached_images())
}
