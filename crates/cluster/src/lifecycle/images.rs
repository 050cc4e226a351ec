//! `minikube image` and `minikube cache`.
use std::collections::BTreeSet;
use std::path::Path;

use machine_rpc::MachineState;
use tracing::{debug, info, warn};

use crate::cache::images;
use crate::command::Asset;
use crate::config::{ClusterConfig, Settings};
use crate::constants::vmpath;
use crate::out::Icon;
use crate::reason;

use super::{load_config, NodeHandle};

/// The loaded handles of the running nodes of `cc`.
async fn running_nodes(settings: &Settings, cc: &ClusterConfig) -> anyhow::Result<Vec<NodeHandle>> {
    let mut handles = Vec::new();
    for node in &cc.nodes {
        let handle = match NodeHandle::load(&settings.home, cc, node).await {
            Ok(h) => h,
            Err(e) => {
                debug!(profile = %cc.name, error = %e, "skipping node that does not load");
                continue;
            }
        };
        if handle.state().await? != MachineState::Running {
            debug!(machine = %handle.machine_name, "skipping node that is not running");
            continue;
        }
        handles.push(handle);
    }
    Ok(handles)
}

async fn load_into(settings: &Settings, cc: &ClusterConfig, refs: &[String]) -> anyhow::Result<usize> {
    let handles = running_nodes(settings, cc).await?;
    for handle in &handles {
        let runtime = handle.runtime(cc)?;
        images::load_cached_images(&settings.home, handle.runner.as_ref(), runtime.as_ref(), refs).await?;
    }
    Ok(handles.len())
}

async fn remove_from(settings: &Settings, cc: &ClusterConfig, refs: &[String]) -> anyhow::Result<()> {
    for handle in running_nodes(settings, cc).await? {
        images::remove_images(handle.runtime(cc)?.as_ref(), refs).await?;
    }
    Ok(())
}

/// `minikube image load`: loads images into every running node of the
/// profile. An argument naming a local file is taken as an image tarball,
/// anything else is cached from the host first.
pub async fn load(settings: &Settings, args: &[String]) -> anyhow::Result<()> {
    let out = settings.out();
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let (tarballs, refs): (Vec<String>, Vec<String>) = args.iter().cloned().partition(|a| Path::new(a).is_file());

    if !refs.is_empty() {
        load_into(settings, &cc, &refs).await?;
    }
    for tarball in tarballs {
        let name = Path::new(&tarball)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let asset = Asset::file(&tarball, vmpath::GUEST_IMAGES_DIR, name, "0644");
        for handle in running_nodes(settings, &cc).await? {
            handle
                .runner
                .copy(&asset)
                .await
                .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
            handle
                .runtime(&cc)?
                .load_image(&asset.target_path())
                .await
                .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
        }
        info!(%tarball, "loaded image tarball");
    }
    out.step(Icon::Check, format!("Loaded {} image(s) into \"{}\"", args.len(), cc.name));
    Ok(())
}

/// `minikube image rm`.
pub async fn remove(settings: &Settings, refs: &[String]) -> anyhow::Result<()> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    remove_from(settings, &cc, refs).await
}

/// `minikube image ls`: the images of every running node, sorted.
pub async fn list(settings: &Settings) -> anyhow::Result<Vec<String>> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let mut found = BTreeSet::new();
    for handle in running_nodes(settings, &cc).await? {
        let listed = handle
            .runtime(&cc)?
            .list_images()
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_STATUS, e))?;
        found.extend(listed);
    }
    Ok(found.into_iter().collect())
}

/// Valid profiles whose control plane is running.
async fn running_profiles(settings: &Settings) -> anyhow::Result<Vec<ClusterConfig>> {
    let mut running = Vec::new();
    for profile in settings.store().list_valid().await? {
        let cc = match profile.config {
            Some(cc) => cc,
            None => continue,
        };
        let primary = match cc.primary_control_plane() {
            Ok(n) => n,
            Err(_) => continue,
        };
        match NodeHandle::load(&settings.home, &cc, &primary).await {
            Ok(h) if matches!(h.state().await, Ok(MachineState::Running)) => running.push(cc),
            _ => debug!(profile = %cc.name, "profile is not running"),
        }
    }
    Ok(running)
}

/// `minikube cache add`: caches the images on the host, records them in the
/// user config and loads them into every running profile.
pub async fn cache_add(settings: &Settings, refs: &[String]) -> anyhow::Result<BTreeSet<String>> {
    images::cache_images(&settings.home, refs).await?;
    let set = images::add_to_cache_list(&settings.home, refs).await?;
    for cc in running_profiles(settings).await? {
        if let Err(e) = load_into(settings, &cc, refs).await {
            warn!(profile = %cc.name, error = %e, "loading cached images");
        }
    }
    Ok(set)
}

/// `minikube cache delete`.
pub async fn cache_delete(settings: &Settings, refs: &[String]) -> anyhow::Result<BTreeSet<String>> {
    let set = images::delete_from_cache_list(&settings.home, refs).await?;
    images::delete_cached(&settings.home, refs).await?;
    for cc in running_profiles(settings).await? {
        if let Err(e) = remove_from(settings, &cc, refs).await {
            warn!(profile = %cc.name, error = %e, "removing cached images");
        }
    }
    Ok(set)
}

/// `minikube cache list`.
pub async fn cache_list(settings: &Settings) -> anyhow::Result<BTreeSet<String>> {
    images::cache_list(&settings.home)
        .await
        .map_err(|e| reason::with_kind(reason::INTERNAL_CACHE_LIST, e))
}

/// `minikube cache reload`: loads every cached image into every running
/// profile. Returns the number of profiles reloaded.
pub async fn cache_reload(settings: &Settings) -> anyhow::Result<usize> {
    let refs: Vec<String> = cache_list(settings).await?.into_iter().collect();
    if refs.is_empty() {
        return Ok(0);
    }
    let mut reloaded = 0;
    for cc in running_profiles(settings).await? {
        load_into(settings, &cc, &refs)
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_CACHE_LOAD, e))?;
        reloaded += 1;
    }
    Ok(reloaded)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::localpath::MiniHome;

    fn settings(dir: &Path) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir));
        s.output = crate::out::Format::Json;
        s
    }

    #[tokio::test]
    async fn the_cache_list_is_a_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let a = vec!["busybox:1.36".to_string()];
        let b = vec!["nginx:1.25".to_string(), "busybox:1.36".to_string()];
        images::add_to_cache_list(&settings.home, &a).await.expect("add");
        images::add_to_cache_list(&settings.home, &b).await.expect("add");
        let listed = cache_list(&settings).await.expect("list");
        assert_eq!(listed.into_iter().collect::<Vec<_>>(), vec!["busybox:1.36", "nginx:1.25"]);

        let after = cache_delete(&settings, &["nginx:1.25".to_string()]).await.expect("delete");
        assert_eq!(after.into_iter().collect::<Vec<_>>(), vec!["busybox:1.36"]);
    }

    #[tokio::test]
    async fn reload_without_cached_images_does_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(cache_reload(&settings(dir.path())).await.expect("reload"), 0);
    }

    #[tokio::test]
    async fn stopped_profiles_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let cc = crate::lifecycle::test::cluster("minikube", "kvm2", 1);
        settings.store().save("minikube", &cc).await.expect("save");
        assert!(list(&settings).await.expect("list").is_empty());
        assert!(running_profiles(&settings).await.expect("running").is_empty());
    }
}
