use cluster::config::Settings;
use cluster::lifecycle::access;
use cluster::out::Icon;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::exec;

#[derive(StructOpt, Clone, Debug)]
pub struct Ssh {
    #[structopt(short = "n", long = "node", default_value = "", help = "The node to ssh into. Defaults to the primary control plane.")]
    node: String,

    /// Command to run instead of an interactive shell
    #[structopt(last = true)]
    command: Vec<String>,
}

impl Ssh {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let argv = access::ssh_argv(settings, &self.node, &self.command).await?;
        exec(&argv).await
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Cp {
    /// `<source node name>:<source path>` or a local path
    src: String,
    /// `<target node name>:<target path>` or a local path
    dst: String,
}

impl Cp {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        access::copy(settings, &self.src, &self.dst).await?;
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Ip {
    #[structopt(short = "n", long = "node", default_value = "", help = "The node to get IP. Defaults to the primary control plane.")]
    node: String,
}

impl Ip {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let ip = access::ip(settings, &self.node).await?;
        settings.out().raw(&format!("{}\n", ip));
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Kubectl {
    /// Arguments passed to kubectl, after `--`
    #[structopt(last = true)]
    args: Vec<String>,
}

impl Kubectl {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let argv = access::kubectl(settings, &self.args).await?;
        debug!(?argv, "running kubectl");
        exec(&argv).await
    }
}

pub async fn update_context(settings: &Settings) -> anyhow::Result<i32> {
    access::update_context(settings).await?;
    Ok(0)
}

#[derive(StructOpt, Clone, Debug)]
pub struct Service {
    /// The service to reach
    name: String,

    #[structopt(short = "n", long = "namespace", default_value = "default", help = "The service namespace")]
    namespace: String,

    #[structopt(long = "url", help = "Display the Kubernetes service URL in the CLI instead of opening it in the default browser")]
    url: bool,

    #[structopt(long = "https", help = "Open the service URL with https instead of http")]
    https: bool,
}

impl Service {
    /// Prints the service URLs. Forwards opened for the URLs stay up until
    /// `token` is cancelled.
    pub async fn run(&self, settings: &Settings, token: CancellationToken) -> anyhow::Result<i32> {
        let out = settings.out();
        let urls = access::service_urls(settings, &self.namespace, &self.name, self.https).await?;
        for url in &urls.urls {
            if self.url {
                out.raw(&format!("{}\n", url));
            } else {
                out.step(Icon::Celebrate, format!("Opening service {}/{} in default browser...", self.namespace, self.name));
                open_browser(url);
            }
        }
        if !urls.forwards.is_empty() {
            out.warning("Because you are using a Docker driver on a remote daemon, the terminal needs to be open to run it.");
            token.cancelled().await;
        }
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Dashboard {
    #[structopt(long = "url", help = "Display dashboard URL instead of opening a browser")]
    url: bool,

    #[structopt(long = "port", default_value = "0", help = "Exposed port of the proxyfied dashboard. Set to 0 to pick a random port.")]
    port: u16,
}

impl Dashboard {
    /// Runs the dashboard proxy until `token` is cancelled.
    pub async fn run(&self, settings: &Settings, token: CancellationToken) -> anyhow::Result<i32> {
        let out = settings.out();
        out.step(Icon::Verify, "Verifying dashboard health ...");
        let (url, mut proxy) = access::dashboard(settings, self.port).await?;
        if self.url {
            out.raw(&format!("{}\n", url));
        } else {
            out.step(Icon::Celebrate, "Opening in your default browser...");
            open_browser(&url);
        }
        tokio::select! {
            _ = token.cancelled() => {
                let _ = proxy.kill().await;
            }
            status = proxy.wait() => {
                debug!(?status, "dashboard proxy exited");
            }
        }
        Ok(0)
    }
}

/// Hands `url` to the desktop's opener. Failures are only logged.
fn open_browser(url: &str) {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else if cfg!(windows) {
        ("cmd", vec!["/c", "start", url])
    } else {
        ("xdg-open", vec![url])
    };
    if let Err(e) = std::process::Command::new(program).args(args).spawn() {
        debug!(error = %e, %url, "opening browser");
        println!("{}", url);
    }
}
