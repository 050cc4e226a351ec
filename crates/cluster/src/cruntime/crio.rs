use std::sync::Arc;

use super::{cri, write_crictl_config, ContainerState, Manager, RuntimeKind, RuntimeOptions};
use crate::command::{Asset, Cmd, Runner};

const SOCKET: &str = "unix:///var/run/crio/crio.sock";
const RUNC_ROOT: &str = "/run/runc";

pub struct Crio {
    runner: Arc<dyn Runner>,
}

impl Crio {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Crio { runner }
    }

    /// The drop-in written to `/etc/crio/crio.conf.d/02-crio.conf`.
    pub fn drop_in(opts: &RuntimeOptions) -> String {
        let mut out = format!("[crio.image]\npause_image = \"{}\"\n", opts.pause_image());
        if !opts.insecure_registry.is_empty() {
            let quoted: Vec<String> = opts
                .insecure_registry
                .iter()
                .map(|r| format!("\"{}\"", r))
                .collect();
            out.push_str(&format!("insecure_registries = [{}]\n", quoted.join(", ")));
        }
        out.push_str(&format!(
            "\n[crio.runtime]\ncgroup_manager = \"{}\"\nconmon_cgroup = \"pod\"\n",
            opts.cgroup_driver()
        ));
        out
    }

    /// Mirrors for docker.io in containers-registries.conf format.
    pub fn registries(mirrors: &[String]) -> String {
        let mut out = String::from("[[registry]]\nprefix = \"docker.io\"\nlocation = \"docker.io\"\n");
        for m in mirrors {
            let location = m
                .trim_start_matches("https://")
                .trim_start_matches("http://");
            out.push_str(&format!("\n[[registry.mirror]]\nlocation = \"{}\"\n", location));
        }
        out
    }
}

#[async_trait::async_trait]
impl Manager for Crio {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Crio
    }

    fn socket_path(&self) -> String {
        SOCKET.to_string()
    }

    fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    async fn version(&self) -> anyhow::Result<String> {
        let res = self.runner.run(Cmd::new("crio").arg("--version")).await?;
        let out = res.stdout_str();
        Ok(out
            .lines()
            .find_map(|l| l.strip_prefix("Version:"))
            .map(|v| v.trim().to_string())
            .unwrap_or_default())
    }

    async fn enable(&self, opts: &RuntimeOptions) -> anyhow::Result<()> {
        self.runner
            .copy(&Asset::memory(
                Self::drop_in(opts).into_bytes(),
                "/etc/crio/crio.conf.d",
                "02-crio.conf",
                "0644",
            ))
            .await?;
        if !opts.registry_mirror.is_empty() {
            self.runner
                .copy(&Asset::memory(
                    Self::registries(&opts.registry_mirror).into_bytes(),
                    "/etc/containers/registries.conf.d",
                    "99-minikube.conf",
                    "0644",
                ))
                .await?;
        }
        self.runner
            .run(Cmd::sudo("systemctl").arg("daemon-reload"))
            .await?;
        self.runner
            .run(Cmd::sudo("systemctl").args(["restart", "crio"]))
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
            .run(Cmd::sudo("podman").args(["load", "-i", path]))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> anyhow::Result<()> {
        self.runner.run(Cmd::sudo("podman").args(["rmi", name])).await?;
        Ok(())
    }

    async fn list_images(&self) -> anyhow::Result<Vec<String>> {
        cri::list_images(self.runner.as_ref()).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn configuration_files() {
        let opts = RuntimeOptions {
            kubernetes_version: "v1.28.0".to_string(),
            insecure_registry: vec!["10.0.0.5:5000".to_string()],
            cgroup_driver: "cgroupfs".to_string(),
            ..Default::default()
        };
        let conf = Crio::drop_in(&opts);
        assert!(conf.contains("pause_image = \"registry.k8s.io/pause:3.10\""));
        assert!(conf.contains("insecure_registries = [\"10.0.0.5:5000\"]"));
        assert!(conf.contains("cgroup_manager = \"cgroupfs\""));

        let reg = Crio::registries(&["https://mirror.gcr.io".to_string()]);
        assert!(reg.contains("[[registry.mirror]]\nlocation = \"mirror.gcr.io\""));
    }
}
