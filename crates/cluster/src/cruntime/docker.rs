use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::cri::lines;
use super::{write_crictl_config, ContainerState, Manager, RuntimeKind, RuntimeOptions};
use crate::command::{Asset, Cmd, Runner};

const DOCKERSHIM_SOCKET: &str = "/var/run/dockershim.sock";
const CRI_DOCKERD_SOCKET: &str = "unix:///var/run/cri-dockerd.sock";

/// Docker Engine, reached by kubelet through cri-dockerd from v1.24 on.
pub struct Docker {
    runner: Arc<dyn Runner>,
    uses_cri_dockerd: bool,
}

impl Docker {
    pub fn new(runner: Arc<dyn Runner>, kubernetes_version: &str) -> Self {
        let uses_cri_dockerd = semver::Version::parse(kubernetes_version.trim_start_matches('v'))
            .map(|v| v >= semver::Version::new(1, 24, 0))
            .unwrap_or(true);
        Docker {
            runner,
            uses_cri_dockerd,
        }
    }

    /// `/etc/docker/daemon.json`.
    pub fn daemon_json(opts: &RuntimeOptions) -> serde_json::Value {
        let mut v = json!({
            "exec-opts": [format!("native.cgroupdriver={}", opts.cgroup_driver())],
            "log-driver": "json-file",
            "log-opts": {"max-size": "100m"},
            "storage-driver": "overlay2",
        });
        if !opts.insecure_registry.is_empty() {
            v["insecure-registries"] = json!(opts.insecure_registry);
        }
        if !opts.registry_mirror.is_empty() {
            v["registry-mirrors"] = json!(opts.registry_mirror);
        }
        v
    }

    /// The systemd drop-in carrying `--docker-env` and `--docker-opt`.
    pub fn service_drop_in(opts: &RuntimeOptions) -> String {
        let mut unit = String::from("[Service]\n");
        for env in &opts.docker_env {
            unit.push_str(&format!("Environment=\"{}\"\n", env));
        }
        let mut exec = String::from(
            "/usr/bin/dockerd -H tcp://0.0.0.0:2376 -H unix:///var/run/docker.sock \
             --tlsverify --tlscacert /etc/docker/ca.pem --tlscert /etc/docker/server.pem \
             --tlskey /etc/docker/server-key.pem",
        );
        for opt in &opts.docker_opt {
            exec.push_str(&format!(" --{}", opt));
        }
        unit.push_str("ExecStart=\n");
        unit.push_str(&format!("ExecStart={}\n", exec));
        unit
    }

    async fn docker(&self, args: &[&str], ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.runner
            .run(Cmd::sudo("docker").args(args.iter().copied()).args(ids.iter().cloned()))
            .await?;
        Ok(())
    }
}

/// A `docker ps` name filter matching pods in `namespaces`.
fn namespace_filter(namespaces: &[String]) -> Option<String> {
    if namespaces.is_empty() {
        None
    } else {
        Some(format!("--filter=name=k8s_.*_({})_", namespaces.join("|")))
    }
}

#[async_trait::async_trait]
impl Manager for Docker {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    fn socket_path(&self) -> String {
        if self.uses_cri_dockerd {
            CRI_DOCKERD_SOCKET.to_string()
        } else {
            DOCKERSHIM_SOCKET.to_string()
        }
    }

    fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    async fn version(&self) -> anyhow::Result<String> {
        let res = self
            .runner
            .run(Cmd::new("docker").args(["version", "--format", "{{.Server.Version}}"]))
            .await?;
        Ok(res.stdout_str().trim().to_string())
    }

    async fn enable(&self, opts: &RuntimeOptions) -> anyhow::Result<()> {
        let daemon = serde_json::to_vec_pretty(&Self::daemon_json(opts))?;
        self.runner
            .copy(&Asset::memory(daemon, "/etc/docker", "daemon.json", "0644"))
            .await?;
        self.runner
            .copy(&Asset::memory(
                Self::service_drop_in(opts).into_bytes(),
                "/etc/systemd/system/docker.service.d",
                "10-machine.conf",
                "0644",
            ))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").arg("daemon-reload"))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["enable", "docker.socket"]))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["restart", "docker"]))
            .await?;
        if self.uses_cri_dockerd {
            self.runner
                .run(Cmd::sudo("systemctl").args(["restart", "cri-docker.socket", "cri-docker.service"]))
                .await?;
        }
        write_crictl_config(self.runner.as_ref(), &self.socket_path()).await
    }

    async fn disable(&self) -> anyhow::Result<()> {
        if self.uses_cri_dockerd {
            if let Err(e) = self
                .runner
                .run(Cmd::sudo("systemctl").args(["stop", "-f", "cri-docker.socket", "cri-docker.service"]))
                .await
            {
                debug!(error = %e, "unable to stop cri-docker");
            }
        }
        self.runner
            .run(Cmd::sudo("systemctl").args(["stop", "-f", "docker.socket", "docker.service"]))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["disable", "docker.socket"]))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, state: ContainerState, namespaces: &[String]) -> anyhow::Result<Vec<String>> {
        let mut cmd = Cmd::new("docker").arg("ps");
        match state {
            ContainerState::All => cmd = cmd.arg("-a"),
            ContainerState::Running => cmd = cmd.arg("--filter=status=running"),
            ContainerState::Paused => cmd = cmd.arg("--filter=status=paused"),
        }
        if let Some(f) = namespace_filter(namespaces) {
            cmd = cmd.arg(f);
        }
        let res = self.runner.run(cmd.arg("--format={{.ID}}")).await?;
        Ok(lines(&res.stdout_str()))
    }

    async fn pause_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        self.docker(&["pause"], ids).await
    }

    async fn unpause_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        self.docker(&["unpause"], ids).await
    }

    async fn stop_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        self.docker(&["stop"], ids).await
    }

    async fn kill_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        self.docker(&["kill"], ids).await
    }

    async fn load_image(&self, path: &str) -> anyhow::Result<()> {
        self.runner
            .run(Cmd::shell(format!("sudo cat {} | docker load", path)))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> anyhow::Result<()> {
        self.runner.run(Cmd::new("docker").args(["rmi", name])).await?;
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        let res = self
            .runner
            .run(Cmd::new("docker").args(["images", "--format", "{{.Repository}}:{{.Tag}}"]))
            .await?;
        let mut images: Vec<String> = lines(&res.stdout_str())
            .into_iter()
            .filter(|i| !i.contains("<none>"))
            .collect();
        images.sort();
        Ok(images)
    }

    async fn preload(&self, tarball: &str) -> anyhow::Result<()> {
        self.runner
            .run(Cmd::sudo("systemctl").args(["stop", "docker"]))
            .await?;
        self.runner
            .run(Cmd::sudo("tar").args([
                "--xattrs",
                "--xattrs-include",
                "security.capability",
                "-I",
                "lz4",
                "-C",
                "/var",
                "-xf",
                tarball,
            ]))
            .await?;
        self.runner.run(Cmd::sudo("rm").args(["-f", tarball])).await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["restart", "docker"]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn daemon_configuration() {
        let opts = RuntimeOptions {
            insecure_registry: vec!["10.0.0.0/24".to_string()],
            cgroup_driver: "cgroupfs".to_string(),
            ..Default::default()
        };
        let v = Docker::daemon_json(&opts);
        assert_eq!(v["exec-opts"][0], "native.cgroupdriver=cgroupfs");
        assert_eq!(v["insecure-registries"][0], "10.0.0.0/24");
        assert!(v.get("registry-mirrors").is_none());

        let unit = Docker::service_drop_in(&RuntimeOptions {
            docker_env: vec!["HTTP_PROXY=http://proxy:3128".to_string()],
            docker_opt: vec!["log-level=debug".to_string()],
            ..Default::default()
        });
        assert!(unit.contains("Environment=\"HTTP_PROXY=http://proxy:3128\"\n"));
        assert!(unit.contains("ExecStart=\n"));
        assert!(unit.trim_end().ends_with("--log-level=debug"));
    }

    #[test]
    fn sockets_follow_the_kubernetes_version() {
        let r: Arc<dyn Runner> = Arc::new(FakeRunner::default());
        assert_eq!(Docker::new(r.clone(), "v1.23.0").socket_path(), DOCKERSHIM_SOCKET);
        assert_eq!(Docker::new(r, "v1.34.0").socket_path(), CRI_DOCKERD_SOCKET);
    }

    #[tokio::test]
    async fn lists_by_namespace() {
        let fake = Arc::new(FakeRunner::default().respond("docker ps", "abc\ndef\n", 0));
        let d = Docker::new(fake.clone(), "v1.34.0");
        let ids = d
            .list_containers(
                ContainerState::Running,
                &["kube-system".to_string(), "kubernetes-dashboard".to_string()],
            )
            .await
            .expect("list");
        assert_eq!(ids, vec!["abc".to_string(), "def".to_string()]);
        assert!(fake.commands()[0].contains("'--filter=name=k8s_.*_(kube-system|kubernetes-dashboard)_'"));

        d.pause_containers(&ids).await.expect("pause");
        assert_eq!(fake.commands()[1], "sudo docker pause abc def");
        d.pause_containers(&[]).await.expect("nothing to pause");
        assert_eq!(fake.commands().len(), 2);
    }
}
