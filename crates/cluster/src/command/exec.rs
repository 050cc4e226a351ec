use std::process::Stdio;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{Cmd, RunResult, Runner};

/// Runs commands directly on the host. Used by the `none` driver.
#[derive(Clone, Debug, Default)]
pub struct ExecRunner {
    /// Drop a leading `sudo` when already running as root.
    strip_sudo: bool,
}

impl ExecRunner {
    pub fn new() -> Self {
        ExecRunner {
            strip_sudo: is_root(),
        }
    }
}

#[async_trait::async_trait]
impl Runner for ExecRunner {
    async fn run(&self, cmd: Cmd) -> anyhow::Result<RunResult> {
        let mut argv = cmd.argv();
        if self.strip_sudo && argv.len() > 1 && argv[0] == "sudo" {
            argv.remove(0);
        }
        Ok(spawn(argv, cmd.stdin).await?.check()?)
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}

/// Spawns `argv` on the host and collects its output. The exit status is
/// recorded, not checked.
pub(crate) async fn spawn(argv: Vec<String>, stdin: Option<Vec<u8>>) -> anyhow::Result<RunResult> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    debug!(command = %argv.join(" "), "running");
    let started = std::time::Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("starting {}", program))?;

    if let Some(data) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // Feed stdin concurrently so a chatty child cannot deadlock us.
            tokio::spawn(async move {
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            });
        }
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {}", program))?;
    let exit_code = output.status.code().unwrap_or(-1);
    trace!(elapsed = ?started.elapsed(), exit_code, "completed");
    Ok(RunResult {
        args: argv,
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code,
    })
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use crate::command::RunError;

    #[tokio::test]
    async fn runs_and_captures_output() {
        let r = ExecRunner::default();
        let res = r
            .run(Cmd::new("sh").args(["-c", "echo out; echo err >&2"]))
            .await
            .expect("run");
        assert_eq!(res.stdout_str(), "out\n");
        assert_eq!(res.stderr_str(), "err\n");
        assert_eq!(res.exit_code, 0);
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let r = ExecRunner::default();
        let res = r
            .run(Cmd::new("cat").stdin(b"piped".to_vec()))
            .await
            .expect("run");
        assert_eq!(res.stdout_str(), "piped");
    }

    #[tokio::test]
    async fn exit_codes_are_preserved() {
        let r = ExecRunner::default();
        let err = r
            .run(Cmd::new("sh").args(["-c", "exit 3"]))
            .await
            .expect_err("exit 3");
        let run_err = err.downcast_ref::<RunError>().expect("RunError");
        assert_eq!(run_err.exit_code, 3);
    }
}
