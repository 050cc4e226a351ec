//! Running commands inside a node.
//!
//! A [`Runner`] executes a [`Cmd`] on one target: the host itself
//! ([`ExecRunner`]), a VM over ssh ([`SshRunner`]) or a container through the
//! container CLI ([`KicRunner`]). Copying files and reading them back is
//! expressed in terms of `run`, so every back-end gets it for free.
use std::fmt;

use anyhow::Context;
use tokio::io::AsyncRead;
use tracing::{debug, instrument};

mod asset;
pub mod cp;
mod exec;
mod kic;
mod ssh;

pub use asset::{Asset, AssetSource};
pub use exec::ExecRunner;
pub use kic::KicRunner;
pub use ssh::{bracket_ipv6, SshClient, SshRunner};

/// A command to run on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            ..Default::default()
        }
    }

    /// A script run by `/bin/bash -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Cmd::new("/bin/bash").arg("-c").arg(script)
    }

    /// `sudo` followed by `program`.
    pub fn sudo(program: impl Into<String>) -> Self {
        Cmd::new("sudo").arg(program)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    /// The full argv.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The command as a single shell-quoted string.
    pub fn render(&self) -> String {
        self.argv()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quotes `s` for a POSIX shell when it contains anything special.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'\''"#))
    }
}

/// The outcome of a command.
#[derive(Clone, Debug, Default)]
pub struct RunResult {
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl RunResult {
    /// The command line, for logs.
    pub fn command(&self) -> String {
        self.args
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr.
    pub fn output(&self) -> String {
        let mut s = self.stdout_str();
        let err = self.stderr_str();
        if !err.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&err);
        }
        s
    }

    /// Turns a non-zero exit into a [`RunError`].
    pub fn check(self) -> Result<RunResult, RunError> {
        if self.exit_code == 0 {
            Ok(self)
        } else {
            Err(RunError {
                command: self.command(),
                exit_code: self.exit_code,
                stdout: self.stdout_str(),
                stderr: self.stderr_str(),
            })
        }
    }
}

/// A command that ran but exited non-zero.
#[derive(Debug, thiserror::Error)]
#[error("{command}: Process exited with status {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
pub struct RunError {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A file read back from a node.
pub struct ReadableFile {
    pub source_path: String,
    pub length: u64,
    pub permissions: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// Runs commands on one target.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Runs `cmd` to completion. A non-zero exit is an `Err` wrapping a
    /// [`RunError`].
    async fn run(&self, cmd: Cmd) -> anyhow::Result<RunResult>;

    /// A short description of the target, for logs.
    fn target(&self) -> String;

    /// Installs `asset` at its target path with its permissions.
    #[instrument(level = "debug", skip(self, asset), fields(dst = %asset.target_path()))]
    async fn copy(&self, asset: &Asset) -> anyhow::Result<()> {
        let data = asset.bytes().await?;
        let dst = asset.target_path();
        debug!(target = %self.target(), src = %asset.source_description(), %dst, bytes = data.len(), "copying asset");
        let script = format!(
            "sudo mkdir -p {dir} && sudo tee {dst} > /dev/null && sudo chmod {perm} {dst}",
            dir = shell_quote(&asset.target_dir),
            dst = shell_quote(&dst),
            perm = shell_quote(&asset.permissions),
        );
        self.run(Cmd::shell(script).stdin(data))
            .await
            .with_context(|| format!("copying {} to {}", asset.source_description(), dst))?;
        Ok(())
    }

    /// Deletes the installed copy of `asset`.
    async fn remove(&self, asset: &Asset) -> anyhow::Result<()> {
        self.run(Cmd::sudo("rm").arg("-f").arg(asset.target_path()))
            .await
            .map(|_| ())
    }

    /// Streams a file from the target.
    async fn readable_file(&self, path: &str) -> anyhow::Result<ReadableFile> {
        let stat = self
            .run(Cmd::sudo("stat").args(["-c", "%s %a", path]))
            .await
            .with_context(|| format!("stat {}", path))?;
        let out = stat.stdout_str();
        let mut fields = out.split_whitespace();
        let length = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("unexpected stat output {:?}", out))?;
        let permissions = format!("0{}", fields.next().unwrap_or("644"));
        let data = self
            .run(Cmd::sudo("cat").arg(path))
            .await
            .with_context(|| format!("cat {}", path))?
            .stdout;
        Ok(ReadableFile {
            source_path: path.to_string(),
            length,
            permissions,
            reader: Box::new(std::io::Cursor::new(data)),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A scripted runner for tests.
    use std::sync::Mutex;

    use super::*;

    /// Answers commands from a table of `(prefix, stdout, exit code)` and
    /// records every command it saw.
    #[derive(Default)]
    pub struct FakeRunner {
        pub responses: Vec<(String, String, i32)>,
        pub seen: Mutex<Vec<Cmd>>,
    }

    impl FakeRunner {
        pub fn respond(mut self, prefix: &str, stdout: &str, code: i32) -> Self {
            self.responses
                .push((prefix.to_string(), stdout.to_string(), code));
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.seen
                .lock()
                .expect("lock")
                .iter()
                .map(|c| c.render())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Runner for FakeRunner {
        async fn run(&self, cmd: Cmd) -> anyhow::Result<RunResult> {
            let rendered = cmd.render();
            self.seen.lock().expect("lock").push(cmd.clone());
            let (stdout, code) = self
                .responses
                .iter()
                .find(|(p, _, _)| rendered.contains(p.as_str()))
                .map(|(_, out, code)| (out.clone(), *code))
                .unwrap_or_default();
            let res = RunResult {
                args: cmd.argv(),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
                exit_code: code,
            };
            Ok(res.check()?)
        }

        fn target(&self) -> String {
            "fake".to_string()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain/path-1.2"), "plain/path-1.2");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        let cmd = Cmd::sudo("systemctl").args(["restart", "docker"]);
        assert_eq!(cmd.render(), "sudo systemctl restart docker");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let res = RunResult {
            args: vec!["false".to_string()],
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            exit_code: 5,
        };
        let err = res.check().expect_err("exit 5");
        assert_eq!(err.exit_code, 5);
        assert!(err.to_string().starts_with("false: Process exited with status 5"));
    }

    #[tokio::test]
    async fn copy_uses_tee_with_stdin() {
        let runner = fake::FakeRunner::default();
        let asset = Asset::memory(b"hello".to_vec(), "/etc/x", "y.conf", "0644");
        runner.copy(&asset).await.expect("copy");
        let seen = runner.seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stdin.as_deref(), Some(&b"hello"[..]));
        assert!(seen[0].args[1].contains("sudo tee /etc/x/y.conf"));
        assert!(seen[0].args[1].contains("sudo chmod 0644 /etc/x/y.conf"));
    }

    #[tokio::test]
    async fn readable_file_reports_stat() {
        use tokio::io::AsyncReadExt;

        let runner = fake::FakeRunner::default()
            .respond("stat", "5 600\n", 0)
            .respond("cat", "hello", 0);
        let mut f = runner.readable_file("/etc/secret").await.expect("read");
        assert_eq!(f.length, 5);
        assert_eq!(f.permissions, "0600");
        let mut buf = String::new();
        f.reader.read_to_string(&mut buf).await.expect("read");
        assert_eq!(buf, "hello");
    }
}
