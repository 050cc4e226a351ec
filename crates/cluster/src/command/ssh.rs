use std::path::PathBuf;
use std::time::Duration;

use super::exec::spawn;
use super::{Cmd, RunResult, Runner};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

/// How to reach a node over ssh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshClient {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

impl SshClient {
    pub fn new(hostname: impl Into<String>, port: u16, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        SshClient {
            hostname: hostname.into(),
            port,
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Options shared by every invocation of the ssh client.
    pub fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-F",
            "/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=quiet",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "ServerAliveInterval=60",
            "-o",
            "IdentitiesOnly=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if !self.key_path.as_os_str().is_empty() {
            args.push("-i".to_string());
            args.push(self.key_path.display().to_string());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}@{}", self.user, self.hostname));
        args
    }

    /// argv running `remote` on the node, or an interactive shell.
    pub fn command(&self, remote: Option<&str>) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.base_args());
        if let Some(r) = remote {
            argv.push("--".to_string());
            argv.push(r.to_string());
        }
        argv
    }

    /// argv forwarding `127.0.0.1:local_port` to `remote_host:remote_port`
    /// as seen from the node, without running a command.
    pub fn forward(&self, local_port: u16, remote_host: &str, remote_port: u16) -> Vec<String> {
        let mut argv = vec![
            "ssh".to_string(),
            "-N".to_string(),
            "-L".to_string(),
            format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ];
        argv.extend(self.base_args());
        argv
    }

    /// The `ssh://` URL of the node.
    pub fn url(&self) -> String {
        format!("ssh://{}@{}:{}", self.user, bracket_ipv6(&self.hostname), self.port)
    }
}

/// Wraps IPv6 literals in brackets for use in URLs.
pub fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Runs commands on a VM through the system ssh client.
#[derive(Clone, Debug)]
pub struct SshRunner {
    client: SshClient,
}

impl SshRunner {
    pub fn new(client: SshClient) -> Self {
        SshRunner { client }
    }

    pub fn client(&self) -> &SshClient {
        &self.client
    }
}

#[async_trait::async_trait]
impl Runner for SshRunner {
    async fn run(&self, cmd: Cmd) -> anyhow::Result<RunResult> {
        let argv = self.client.command(Some(&cmd.render()));
        let mut res = spawn(argv, cmd.stdin.clone()).await?;
        if res.exit_code == SSH_CONNECTION_FAILED {
            anyhow::bail!(
                "ssh to {}:{} failed: {}",
                self.client.hostname,
                self.client.port,
                res.stderr_str().trim()
            );
        }
        // Report the command the caller asked for, not the ssh wrapper.
        res.args = cmd.argv();
        Ok(res.check()?)
    }

    fn target(&self) -> String {
        format!("{}:{}", self.client.hostname, self.client.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_arguments() {
        let c = SshClient::new("127.0.0.1", 2222, "docker", "/m/machines/p/id_rsa");
        let argv = c.command(Some("uname -a"));
        assert_eq!(argv[0], "ssh");
        assert!(argv.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(argv.windows(2).any(|w| w == ["-i", "/m/machines/p/id_rsa"]));
        assert!(argv.contains(&"docker@127.0.0.1".to_string()));
        assert_eq!(argv[argv.len() - 2..], ["--".to_string(), "uname -a".to_string()]);

        let fwd = c.forward(40000, "10.0.0.2", 8443);
        assert!(fwd.contains(&"127.0.0.1:40000:10.0.0.2:8443".to_string()));
        assert!(fwd.contains(&"-N".to_string()));
    }

    #[test]
    fn urls_bracket_ipv6() {
        assert_eq!(
            SshClient::new("fd00::2", 22, "docker", "").url(),
            "ssh://docker@[fd00::2]:22"
        );
        assert_eq!(bracket_ipv6("192.168.49.2"), "192.168.49.2");
        assert_eq!(bracket_ipv6("[::1]"), "[::1]");
    }
}
