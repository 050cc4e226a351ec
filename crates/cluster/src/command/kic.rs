use super::exec::spawn;
use super::{Cmd, RunResult, Runner};

/// Runs commands inside a node container with `docker exec` or
/// `podman exec`.
#[derive(Clone, Debug)]
pub struct KicRunner {
    container: String,
    oci_bin: String,
}

impl KicRunner {
    pub fn new(container: impl Into<String>, oci_bin: impl Into<String>) -> Self {
        KicRunner {
            container: container.into(),
            oci_bin: oci_bin.into(),
        }
    }

    fn exec_argv(&self, cmd: &Cmd) -> Vec<String> {
        let mut argv = Vec::new();
        if self.oci_bin == "podman" && !crate::driver::kic::rootless() {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push(self.oci_bin.clone());
        argv.push("exec".to_string());
        if cmd.stdin.is_some() {
            argv.push("-i".to_string());
        }
        argv.push("--privileged".to_string());
        argv.push(self.container.clone());
        argv.extend(cmd.argv());
        argv
    }
}

#[async_trait::async_trait]
impl Runner for KicRunner {
    async fn run(&self, cmd: Cmd) -> anyhow::Result<RunResult> {
        let mut res = spawn(self.exec_argv(&cmd), cmd.stdin.clone()).await?;
        res.args = cmd.argv();
        Ok(res.check()?)
    }

    fn target(&self) -> String {
        format!("{} container {}", self.oci_bin, self.container)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exec_arguments() {
        let r = KicRunner::new("minikube", "docker");
        let argv = r.exec_argv(&Cmd::sudo("systemctl").arg("is-active").arg("kubelet"));
        assert_eq!(
            argv,
            vec!["docker", "exec", "--privileged", "minikube", "sudo", "systemctl", "is-active", "kubelet"]
        );
        let with_stdin = r.exec_argv(&Cmd::new("tee").stdin(vec![1]));
        assert_eq!(with_stdin[2], "-i");
    }
}
