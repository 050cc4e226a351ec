use std::sync::Arc;

use super::{cri, write_crictl_config, ContainerState, Manager, RuntimeKind, RuntimeOptions};
use crate::command::{Asset, Cmd, Runner};
use crate::constants;

const SOCKET: &str = "unix:///run/containerd/containerd.sock";
const CONFIG: &str = "/etc/containerd/config.toml";
const CERTS_DIR: &str = "/etc/containerd/certs.d";
const RUNC_ROOT: &str = "/run/containerd/runc/k8s.io";

pub struct Containerd {
    runner: Arc<dyn Runner>,
}

impl Containerd {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Containerd { runner }
    }

    /// `hosts.toml` for one insecure registry.
    pub fn insecure_hosts(registry: &str) -> String {
        let host = registry
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        format!(
            "server = \"http://{host}\"\n\n[host.\"http://{host}\"]\n  capabilities = [\"pull\", \"resolve\", \"push\"]\n  skip_verify = true\n",
            host = host
        )
    }

    /// `hosts.toml` sending docker.io pulls through mirrors first.
    pub fn mirror_hosts(mirrors: &[String]) -> String {
        let mut out = String::from("server = \"https://registry-1.docker.io\"\n");
        for m in mirrors {
            let url = if m.contains("://") {
                m.clone()
            } else {
                format!("https://{}", m)
            };
            out.push_str(&format!(
                "\n[host.\"{}\"]\n  capabilities = [\"pull\", \"resolve\"]\n",
                url
            ));
        }
        out
    }

    async fn sed(&self, expr: &str) -> anyhow::Result<()> {
        self.runner
            .run(Cmd::sudo("sed").args(["-i", "-r", expr, CONFIG]))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Manager for Containerd {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Containerd
    }

    fn socket_path(&self) -> String {
        SOCKET.to_string()
    }

    fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    async fn version(&self) -> anyhow::Result<String> {
        let res = self.runner.run(Cmd::new("containerd").arg("--version")).await?;
        let out = res.stdout_str();
        Ok(out.split_whitespace().nth(2).unwrap_or_default().to_string())
    }

    async fn enable(&self, opts: &RuntimeOptions) -> anyhow::Result<()> {
        self.sed(&format!(
            r#"s|^( *)sandbox_image = .*$|\1sandbox_image = "{}"|"#,
            opts.pause_image()
        ))
        .await?;
        let systemd = opts.cgroup_driver() == constants::SYSTEMD_CGROUP_DRIVER;
        self.sed(&format!(r"s|^( *)SystemdCgroup = .*$|\1SystemdCgroup = {}|g", systemd))
            .await?;
        self.sed(&format!(r#"s|^( *)config_path = .*$|\1config_path = "{}"|g"#, CERTS_DIR))
            .await?;

        for registry in &opts.insecure_registry {
            let host = registry
                .trim_start_matches("http://")
                .trim_start_matches("https://");
            self.runner
                .copy(&Asset::memory(
                    Self::insecure_hosts(registry).into_bytes(),
                    format!("{}/{}", CERTS_DIR, host),
                    "hosts.toml",
                    "0644",
                ))
                .await?;
        }
        if !opts.registry_mirror.is_empty() {
            self.runner
                .copy(&Asset::memory(
                    Self::mirror_hosts(&opts.registry_mirror).into_bytes(),
                    format!("{}/docker.io", CERTS_DIR),
                    "hosts.toml",
                    "0644",
                ))
                .await?;
        }

        self.runner
            .run(Cmd::sudo("systemctl").arg("daemon-reload"))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["restart", "containerd"]))
            .await?;
        write_crictl_config(self.runner.as_ref(), SOCKET).await
    }

    async fn list_containers(&self, state: ContainerState, namespaces: &[String]) -> anyhow::Result<Vec<String>> {
        cri::list_containers(self.runner.as_ref(), RUNC_ROOT, state, namespaces).await
    }

    async fn pause_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        cri::runc_each(self.runner.as_ref(), RUNC_ROOT, "pause", ids).await
    }

    async fn unpause_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        cri::runc_each(self.runner.as_ref(), RUNC_ROOT, "resume", ids).await
    }

    async fn stop_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        cri::stop(self.runner.as_ref(), ids, 10).await
    }

    async fn kill_containers(&self, ids: &[String]) -> anyhow::Result<()> {
        cri::stop(self.runner.as_ref(), ids, 0).await
    }

    async fn load_image(&self, path: &str) -> anyhow::Result<()> {
        self.runner
            .run(Cmd::sudo("ctr").args(["-n=k8s.io", "images", "import", path]))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> anyhow::Result<()> {
        self.runner.run(Cmd::sudo("crictl").args(["rmi", name])).await?;
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        cri::list_images(self.runner.as_ref()).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn registry_hosts() {
        let h = Containerd::insecure_hosts("http://10.0.0.5:5000");
        assert!(h.starts_with("server = \"http://10.0.0.5:5000\""));
        assert!(h.contains("skip_verify = true"));
        let m = Containerd::mirror_hosts(&["mirror.gcr.io".to_string()]);
        assert!(m.contains("[host.\"https://mirror.gcr.io\"]"));
    }

    #[tokio::test]
    async fn enable_restarts_containerd() {
        let fake = Arc::new(FakeRunner::default());
        let c = Containerd::new(fake.clone());
        let opts = RuntimeOptions {
            kubernetes_version: "v1.34.0".to_string(),
            insecure_registry: vec!["10.0.0.5:5000".to_string()],
            ..Default::default()
        };
        c.enable(&opts).await.expect("enable");
        let cmds = fake.commands();
        assert!(cmds[0].contains("sandbox_image = \"registry.k8s.io/pause:3.10\""));
        assert!(cmds[1].contains("SystemdCgroup = true"));
        assert!(cmds.iter().any(|c| c.contains("/etc/containerd/certs.d/10.0.0.5:5000")));
        assert!(cmds.iter().any(|c| c == "sudo systemctl restart containerd"));
        assert!(cmds.last().map_or(false, |c| c.contains("crictl.yaml")));
    }
}
