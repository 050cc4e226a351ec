use std::collections::BTreeMap;

use cluster::config::Settings;
use cluster::lifecycle::connect::{self, EnvOptions, MountOptions};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

/// Flags of `docker-env` and `podman-env`.
#[derive(StructOpt, Clone, Debug)]
pub struct Env {
    #[structopt(long = "shell", default_value = "", help = "Force environment to be configured for a specified shell: [fish, cmd, powershell, tcsh, bash, zsh, none], default is auto-detect")]
    shell: String,

    #[structopt(short = "u", long = "unset", help = "Unset variables instead of setting them")]
    unset: bool,

    #[structopt(long = "no-proxy", help = "Add machine IP to NO_PROXY environment variable")]
    no_proxy: bool,

    #[structopt(long = "ssh-host", help = "Use SSH connection instead of HTTPS (port 2376)")]
    ssh_host: bool,

    #[structopt(long = "ssh-add", help = "Add SSH identity key to SSH authentication agent")]
    ssh_add: bool,
}

impl Env {
    fn options(&self, output: Option<&str>) -> EnvOptions {
        EnvOptions {
            shell: self.shell.clone(),
            unset: self.unset,
            no_proxy: self.no_proxy,
            ssh_host: self.ssh_host,
            ssh_add: self.ssh_add,
            output: output.unwrap_or("text").to_string(),
        }
    }

    pub async fn docker(&self, settings: &Settings, output: Option<&str>) -> anyhow::Result<i32> {
        let environ: BTreeMap<String, String> = std::env::vars().collect();
        let script = connect::docker_env(settings, &self.options(output), &environ).await?;
        settings.out().raw(&script);
        Ok(0)
    }

    pub async fn podman(&self, settings: &Settings, output: Option<&str>) -> anyhow::Result<i32> {
        let environ: BTreeMap<String, String> = std::env::vars().collect();
        let script = connect::podman_env(settings, &self.options(output), &environ).await?;
        settings.out().raw(&script);
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Tunnel {
    #[structopt(short = "c", long = "cleanup", parse(try_from_str), default_value = "true", help = "call with cleanup=true to remove old tunnels")]
    cleanup: bool,
}

impl Tunnel {
    pub async fn run(&self, settings: &Settings, token: CancellationToken) -> anyhow::Result<i32> {
        connect::tunnel(settings, self.cleanup, token).await?;
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Mount {
    /// `<source directory>:<target directory>`
    #[structopt(default_value = "")]
    mount_string: String,

    #[structopt(long = "ip", default_value = "", help = "Specify the ip that the mount should be setup on")]
    ip: String,

    #[structopt(long = "port", default_value = "0", help = "Specify the port that the mount should be setup on, where 0 means any free port.")]
    port: u16,

    #[structopt(long = "9p-version", help = "Specify the 9p version that the mount should use")]
    version: Option<String>,

    #[structopt(long = "uid", help = "Default user id used for the mount")]
    uid: Option<String>,

    #[structopt(long = "gid", help = "Default group id used for the mount")]
    gid: Option<String>,

    #[structopt(long = "msize", help = "The number of bytes to use for 9p packet payload")]
    msize: Option<u32>,

    #[structopt(long = "mode", parse(try_from_str = parse_mode), help = "File permissions used for the mount, in octal")]
    mode: Option<u32>,

    #[structopt(long = "options", default_value = "", help = "Additional mount options, such as cache=fscache")]
    options: String,

    #[structopt(long = "kill", help = "Kill the mount process spawned by minikube start")]
    kill: bool,
}

fn parse_mode(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
}

impl Mount {
    pub async fn run(&self, settings: &Settings, token: CancellationToken) -> anyhow::Result<i32> {
        let opts = MountOptions {
            mount_string: self.mount_string.clone(),
            ip: self.ip.clone(),
            port: self.port,
            version: self.version.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            msize: self.msize,
            mode: self.mode,
            options: self.options.clone(),
            kill: self.kill,
        };
        connect::mount(settings, &opts, token).await?;
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modes_are_octal() {
        assert_eq!(parse_mode("755").expect("mode"), 0o755);
        assert_eq!(parse_mode("0o700").expect("mode"), 0o700);
        assert!(parse_mode("9").is_err());
    }
}
