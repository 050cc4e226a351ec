use std::path::PathBuf;

use cluster::addons::configure::StdinPrompt;
use cluster::addons::scan;
use cluster::config::Settings;
use cluster::lifecycle::addons;
use cluster::out::Icon;
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
pub enum Addons {
    /// Enables the addon w/ADDON_NAME within minikube
    Enable { name: String },
    /// Disables the addon w/ADDON_NAME within minikube
    Disable { name: String },
    /// Lists all available minikube addons as well as their current statuses (enabled/disabled)
    List,
    /// List image names the addon w/ADDON_NAME used
    Images { name: String },
    /// Configures the addon w/ADDON_NAME within minikube
    Configure {
        name: String,

        #[structopt(short = "f", long = "config-file", help = "An optional configuration file to read addon specific configs from instead of being prompted each time.")]
        config_file: Option<PathBuf>,
    },
    /// Scans the images of every addon for vulnerabilities
    #[structopt(setting = structopt::clap::AppSettings::Hidden)]
    Scan {
        #[structopt(long = "addon-list", default_value = "https://raw.githubusercontent.com/kubernetes/minikube/master/hack/addons-images.yaml", help = "URL or path of the upstream addon image list")]
        source: String,

        #[structopt(long = "status-file", default_value = "status.yaml", help = "Where the scan results are written")]
        status_file: PathBuf,
    },
    /// Overrides the scanned state of an addon
    #[structopt(setting = structopt::clap::AppSettings::Hidden)]
    Toggle {
        name: String,

        #[structopt(long = "disable", help = "Disable the addon instead of enabling it")]
        disable: bool,

        #[structopt(long = "reason", default_value = "", help = "Why the addon is being toggled. Required to disable.")]
        why: String,

        #[structopt(long = "status-file", default_value = "status.yaml", help = "The scan results to update")]
        status_file: PathBuf,
    },
}

impl Addons {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let out = settings.out();
        match self {
            Addons::Enable { name } => addons::set(settings, name, true).await?,
            Addons::Disable { name } => addons::set(settings, name, false).await?,
            Addons::List => out.raw(&format!("{}\n", addons::list(settings).await?.trim_end())),
            Addons::Images { name } => {
                let images = addons::images(settings, name).await?;
                out.step(Icon::Notice, format!("{} has the following images:", name));
                let width = images.iter().map(|(l, _)| l.len()).max().unwrap_or(0).max("IMAGE NAME".len());
                let mut table = format!("|{:<w$}|{}|\n", "IMAGE NAME", "DEFAULT IMAGE", w = width);
                for (logical, image) in images {
                    table.push_str(&format!("|{:<w$}|{}|\n", logical, image, w = width));
                }
                out.raw(&table);
            }
            Addons::Configure { name, config_file } => {
                addons::configure(settings, name, config_file.as_deref(), &mut StdinPrompt).await?;
                out.step(Icon::Check, format!("{} was successfully configured", name));
            }
            Addons::Scan { source, status_file } => {
                let status = addons::scan(source, status_file).await?;
                let disabled = status.values().filter(|s| !s.enabled).count();
                out.step(
                    Icon::Check,
                    format!(
                        "Scanned {} addons, {} disabled, results written to {}",
                        status.len(),
                        disabled,
                        status_file.display()
                    ),
                );
            }
            Addons::Toggle {
                name,
                disable,
                why,
                status_file,
            } => {
                scan::toggle(status_file, name, !disable, why).await?;
                out.step(Icon::Check, format!("{} is now {}", name, if *disable { "disabled" } else { "enabled" }));
            }
        }
        Ok(0)
    }
}
