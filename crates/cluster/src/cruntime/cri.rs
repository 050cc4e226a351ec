//! crictl and runc helpers shared by the CRI runtimes.
use std::collections::HashSet;

use serde::Deserialize;

use super::ContainerState;
use crate::command::{Cmd, Runner};

#[derive(Deserialize)]
struct RuncContainer {
    id: String,
    status: String,
}

/// IDs runc reports as paused under `root`.
async fn paused_ids(runner: &dyn Runner, runc_root: &str) -> anyhow::Result<HashSet<String>> {
    let res = runner
        .run(Cmd::sudo("runc").args(["--root", runc_root, "list", "-f", "json"]))
        .await?;
    let out = res.stdout_str();
    // runc prints "null" when nothing exists.
    let list: Option<Vec<RuncContainer>> = serde_json::from_str(out.trim())?;
    Ok(list
        .unwrap_or_default()
        .into_iter()
        .filter(|c| c.status == "paused")
        .map(|c| c.id)
        .collect())
}

pub(super) async fn list_containers(
    runner: &dyn Runner,
    runc_root: &str,
    state: ContainerState,
    namespaces: &[String],
) -> anyhow::Result<Vec<String>> {
    let mut base = Cmd::sudo("crictl").args(["ps", "--quiet"]);
    base = match state {
        ContainerState::Running => base.arg("--state=Running"),
        ContainerState::All | ContainerState::Paused => base.arg("-a"),
    };
    let mut ids = Vec::new();
    if namespaces.is_empty() {
        ids.extend(lines(&runner.run(base).await?.stdout_str()));
    } else {
        for ns in namespaces {
            let cmd = base
                .clone()
                .arg(format!("--label=io.kubernetes.pod.namespace={}", ns));
            ids.extend(lines(&runner.run(cmd).await?.stdout_str()));
        }
    }
    if state == ContainerState::Paused {
        let paused = paused_ids(runner, runc_root).await?;
        ids.retain(|id| paused.contains(id));
    }
    Ok(ids)
}

pub(super) fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

pub(super) async fn runc_each(runner: &dyn Runner, runc_root: &str, verb: &str, ids: &[String]) -> anyhow::Result<()> {
    for id in ids {
        runner
            .run(Cmd::sudo("runc").args(["--root", runc_root, verb, id.as_str()]))
            .await?;
    }
    Ok(())
}

pub(super) async fn stop(runner: &dyn Runner, ids: &[String], timeout_secs: u32) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    runner
        .run(
            Cmd::sudo("crictl")
                .arg("stop")
                .arg(format!("--timeout={}", timeout_secs))
                .args(ids.iter().cloned()),
        )
        .await?;
    Ok(())
}

#[derive(Deserialize)]
struct CrictlImages {
    #[serde(default)]
    images: Vec<CrictlImage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrictlImage {
    #[serde(default)]
    repo_tags: Vec<String>,
}

pub(super) async fn list_images(runner: &dyn Runner) -> anyhow::Result<Vec<String>> {
    let res = runner
        .run(Cmd::sudo("crictl").args(["images", "--output", "json"]))
        .await?;
    parse_images(&res.stdout_str())
}

fn parse_images(out: &str) -> anyhow::Result<Vec<String>> {
    let parsed: CrictlImages = serde_json::from_str(out)?;
    let mut tags: Vec<String> = parsed
        .images
        .into_iter()
        .flat_map(|i| i.repo_tags)
        .collect();
    tags.sort();
    Ok(tags)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn image_tags() {
        let out = r#"{"images":[{"id":"sha256:1","repoTags":["registry.k8s.io/pause:3.10"]},{"id":"sha256:2","repoTags":[]}]}"#;
        assert_eq!(
            parse_images(out).expect("parse"),
            vec!["registry.k8s.io/pause:3.10".to_string()]
        );
    }

    #[tokio::test]
    async fn paused_listing_intersects_runc() {
        let runner = FakeRunner::default()
            .respond("crictl ps", "aaa\nbbb\n", 0)
            .respond(
                "runc",
                r#"[{"id":"aaa","status":"paused"},{"id":"bbb","status":"running"}]"#,
                0,
            );
        let ids = list_containers(&runner, "/run/runc", ContainerState::Paused, &["kube-system".to_string()])
            .await
            .expect("list");
        assert_eq!(ids, vec!["aaa".to_string()]);
        assert!(runner.commands()[0].contains("--label=io.kubernetes.pod.namespace=kube-system"));
    }
}
