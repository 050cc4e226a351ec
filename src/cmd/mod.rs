//! The `minikube` command tree.
//!
//! Every command is a variant of [`Command`]; its flags are a `structopt`
//! derive next to the code that runs it.
use std::path::PathBuf;

use cluster::config::Settings;
use cluster::localpath::MiniHome;
use cluster::out::Format;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

mod access;
mod addons;
mod cluster_cmd;
mod config;
mod connect;
mod images;
mod node;

/// Global flags shared by every command.
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "minikube",
    about = "minikube provisions and manages local Kubernetes clusters optimized for development workflows."
)]
pub struct Opts {
    #[structopt(
        short = "p",
        long = "profile",
        default_value = "minikube",
        env = "MINIKUBE_PROFILE",
        global = true,
        help = "The name of the minikube VM being used. This can be set to allow having multiple instances of minikube independently."
    )]
    pub profile: String,

    #[structopt(
        short = "b",
        long = "bootstrapper",
        default_value = "kubeadm",
        env = "MINIKUBE_BOOTSTRAPPER",
        global = true,
        help = "The name of the cluster bootstrapper that will set up the Kubernetes cluster."
    )]
    pub bootstrapper: String,

    #[structopt(
        short = "o",
        long = "output",
        env = "MINIKUBE_OUTPUT",
        global = true,
        help = "Format to print stdout in. One of: text, json"
    )]
    pub output: Option<String>,

    #[structopt(
        long = "user",
        default_value = "",
        env = "MINIKUBE_USER",
        global = true,
        help = "Specifies the user executing the operation. Useful for auditing operations executed by 3rd party tools. Defaults to the operating system username."
    )]
    pub user: String,

    #[structopt(long = "skip-audit", global = true, help = "Skip recording the current command in the audit logs.")]
    pub skip_audit: bool,

    #[structopt(long = "rootless", global = true, help = "Force to use rootless driver (docker and podman driver only)")]
    pub rootless: bool,

    #[structopt(
        long = "kube-config",
        global = true,
        help = "Path to the kubeconfig file to use. Defaults to $KUBECONFIG, then ~/.kube/config"
    )]
    pub kube_config: Option<PathBuf>,

    #[structopt(
        long = "minikube-config",
        env = "MINIKUBE_CONFIG",
        global = true,
        help = "Path to the minikube user config file. Defaults to $MINIKUBE_HOME/config/config.json"
    )]
    pub minikube_config: Option<PathBuf>,

    #[structopt(
        short = "v",
        long = "v",
        default_value = "0",
        env = "MINIKUBE_V",
        global = true,
        help = "Number for the log level verbosity"
    )]
    pub verbosity: u8,

    #[structopt(
        long = "log_dir",
        env = "MINIKUBE_LOG_DIR",
        global = true,
        help = "If non-empty, write log files in this directory"
    )]
    pub log_dir: Option<PathBuf>,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(StructOpt, Clone, Debug)]
pub enum Command {
    /// Starts a local Kubernetes cluster
    Start(cluster_cmd::Start),
    /// Stops a running local Kubernetes cluster
    Stop(cluster_cmd::Stop),
    /// Deletes a local Kubernetes cluster
    Delete(cluster_cmd::Delete),
    /// Gets the status of a local Kubernetes cluster
    Status(cluster_cmd::Status),
    /// Pauses Kubernetes
    Pause(cluster_cmd::Pause),
    /// Unpauses Kubernetes
    Unpause(cluster_cmd::Pause),
    /// Adds, removes, or lists additional nodes
    Node(node::Node),
    /// Gets or sets the current profile, or lists every profile
    Profile(config::Profile),
    /// Enables or disables a minikube addon
    Addons(addons::Addons),
    /// Modifies persistent configuration values
    Config(config::Config),
    /// Configures the environment to use minikube's Docker daemon
    #[structopt(name = "docker-env")]
    DockerEnv(connect::Env),
    /// Configures the environment to use minikube's Podman service
    #[structopt(name = "podman-env")]
    PodmanEnv(connect::Env),
    /// Connects to LoadBalancer services
    Tunnel(connect::Tunnel),
    /// Mounts the specified directory into minikube
    Mount(connect::Mount),
    /// Logs into the minikube environment (for debugging)
    Ssh(access::Ssh),
    /// Copies files into minikube
    Cp(access::Cp),
    /// Retrieves the IP address of the specified node
    Ip(access::Ip),
    /// Runs a kubectl binary matching the cluster version
    Kubectl(access::Kubectl),
    /// Updates the kubeconfig in case of an IP or port change
    #[structopt(name = "update-context")]
    UpdateContext,
    /// Returns a URL to connect to a service
    Service(access::Service),
    /// Accesses the Kubernetes dashboard running within the minikube cluster
    Dashboard(access::Dashboard),
    /// Manages images
    Image(images::Image),
    /// Manages the cache of images on the host
    Cache(images::Cache),
}

impl Command {
    /// The name recorded in the audit log.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "start",
            Command::Stop(_) => "stop",
            Command::Delete(_) => "delete",
            Command::Status(_) => "status",
            Command::Pause(_) => "pause",
            Command::Unpause(_) => "unpause",
            Command::Node(_) => "node",
            Command::Profile(_) => "profile",
            Command::Addons(_) => "addons",
            Command::Config(_) => "config",
            Command::DockerEnv(_) => "docker-env",
            Command::PodmanEnv(_) => "podman-env",
            Command::Tunnel(_) => "tunnel",
            Command::Mount(_) => "mount",
            Command::Ssh(_) => "ssh",
            Command::Cp(_) => "cp",
            Command::Ip(_) => "ip",
            Command::Kubectl(_) => "kubectl",
            Command::UpdateContext => "update-context",
            Command::Service(_) => "service",
            Command::Dashboard(_) => "dashboard",
            Command::Image(_) => "image",
            Command::Cache(_) => "cache",
        }
    }

    /// Commands that clean up after themselves when interrupted.
    pub fn handles_interrupt(&self) -> bool {
        matches!(
            self,
            Command::Tunnel(_) | Command::Mount(_) | Command::Dashboard(_) | Command::Service(_)
        )
    }
}

impl Opts {
    /// The settings every command runs with.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut home = MiniHome::from_env()?;
        if let Some(path) = &self.minikube_config {
            home = home.with_config_file(path);
        }
        let mut settings = Settings::new(home);
        settings.profile = self.profile.clone();
        settings.bootstrapper = self.bootstrapper.clone();
        settings.output = match self.output.as_deref() {
            // yaml is only understood by the env commands
            None | Some("yaml") => Format::Text,
            Some(o) => o.parse()?,
        };
        settings.user = self.user.clone();
        settings.rootless = self.rootless || env_flag("MINIKUBE_ROOTLESS");
        settings.skip_audit = self.skip_audit || env_flag("MINIKUBE_SKIP_AUDIT");
        if let Some(path) = &self.kube_config {
            settings.kubeconfig = path.clone();
        }
        Ok(settings)
    }
}

/// Whether a boolean flag is switched on through its environment variable.
fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// Runs `command`, returning the process exit code.
pub async fn run(opts: &Opts, settings: &Settings, token: CancellationToken) -> anyhow::Result<i32> {
    match &opts.command {
        Command::Start(c) => c.run(settings).await,
        Command::Stop(c) => c.run(settings).await,
        Command::Delete(c) => c.run(settings).await,
        Command::Status(c) => c.run(settings, opts.output.as_deref()).await,
        Command::Pause(c) => c.run(settings, true).await,
        Command::Unpause(c) => c.run(settings, false).await,
        Command::Node(c) => c.run(settings).await,
        Command::Profile(c) => c.run(settings).await,
        Command::Addons(c) => c.run(settings).await,
        Command::Config(c) => c.run(settings).await,
        Command::DockerEnv(c) => c.docker(settings, opts.output.as_deref()).await,
        Command::PodmanEnv(c) => c.podman(settings, opts.output.as_deref()).await,
        Command::Tunnel(c) => c.run(settings, token).await,
        Command::Mount(c) => c.run(settings, token).await,
        Command::Ssh(c) => c.run(settings).await,
        Command::Cp(c) => c.run(settings).await,
        Command::Ip(c) => c.run(settings).await,
        Command::Kubectl(c) => c.run(settings).await,
        Command::UpdateContext => access::update_context(settings).await,
        Command::Service(c) => c.run(settings, token).await,
        Command::Dashboard(c) => c.run(settings, token).await,
        Command::Image(c) => c.run(settings).await,
        Command::Cache(c) => c.run(settings).await,
    }
}

/// Runs `argv` with the terminal attached and returns its exit code.
pub(crate) async fn exec(argv: &[String]) -> anyhow::Result<i32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("nothing to run"))?;
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("running {}: {}", program, e))?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::from_iter_safe(std::iter::once("minikube").chain(args.iter().copied()))
            .unwrap_or_else(|e| panic!("{:?}: {}", args, e))
    }

    #[test]
    fn global_flags_go_anywhere() {
        let opts = parse(&["status", "-p", "dev", "--output", "json"]);
        assert_eq!(opts.profile, "dev");
        assert_eq!(opts.output.as_deref(), Some("json"));
        assert_eq!(opts.command.name(), "status");
    }

    #[test]
    fn nested_commands_parse() {
        assert_eq!(parse(&["node", "add", "--worker"]).command.name(), "node");
        assert_eq!(parse(&["addons", "enable", "dashboard"]).command.name(), "addons");
        assert_eq!(parse(&["docker-env", "--unset"]).command.name(), "docker-env");
        assert_eq!(parse(&["kubectl", "--", "get", "pods", "-A"]).command.name(), "kubectl");
        assert!(parse(&["tunnel"]).command.handles_interrupt());
        assert!(!parse(&["stop"]).command.handles_interrupt());
    }

    #[test]
    fn unknown_commands_fail() {
        assert!(Opts::from_iter_safe(&["minikube", "launch"]).is_err());
    }
}
