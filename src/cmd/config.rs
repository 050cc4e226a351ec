use cluster::config::user::{self, UserConfig};
use cluster::config::Settings;
use cluster::lifecycle::profiles;
use cluster::out::{Format, Icon};
use cluster::reason;
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
pub struct Profile {
    /// The profile to make active, or `list` to list every profile
    name: Option<String>,
}

impl Profile {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let out = settings.out();
        match self.name.as_deref() {
            None => out.raw(&format!("{}\n", profiles::active(&settings.home).await)),
            Some("list") => {
                let list = profiles::list(settings).await?;
                match settings.output {
                    Format::Json => out.raw(&format!("{}\n", profiles::render_json(&list)?)),
                    Format::Text => {
                        if list.valid.is_empty() {
                            out.step(Icon::Notice, "No minikube profile was found.");
                        } else {
                            out.raw(&profiles::render_table(&list));
                        }
                        if let Some(notice) = profiles::invalid_notice(&list) {
                            out.warning(notice);
                        }
                    }
                }
            }
            Some(name) => profiles::set_active(settings, name).await?,
        }
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub enum Config {
    /// Sets an individual value in a minikube config file
    Set { name: String, value: String },
    /// Unsets an individual value in a minikube config file
    Unset { name: String },
    /// Gets the value of PROPERTY_NAME from the minikube config file
    Get { name: String },
    /// Displays the values in the minikube config file
    View,
}

impl Config {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let out = settings.out();
        match self {
            Config::Set { name, value } => {
                let setting = user::find_setting(name)?;
                user::validate(setting, value).await?;
                UserConfig::update(&settings.home, |cfg| cfg.set(name, value))
                    .await
                    .map_err(|e| reason::with_kind(reason::INTERNAL_CONFIG_SET, e))?;
                for notice in user::callbacks(setting) {
                    out.info(Icon::Notice, notice);
                }
            }
            Config::Unset { name } => {
                UserConfig::update(&settings.home, |cfg| cfg.unset(name))
                    .await
                    .map_err(|e| reason::with_kind(reason::INTERNAL_CONFIG_UNSET, e))?;
            }
            Config::Get { name } => {
                user::find_setting(name)?;
                let cfg = UserConfig::read(&settings.home.config_file()).await?;
                match cfg.get(name) {
                    Some(serde_json::Value::String(s)) => out.raw(&format!("{}\n", s)),
                    Some(v) => out.raw(&format!("{}\n", v)),
                    None => {
                        return Err(reason::with_kind(
                            reason::INTERNAL_CONFIG_SET,
                            anyhow::anyhow!("specified key could not be found in config"),
                        ))
                    }
                }
            }
            Config::View => {
                let cfg = UserConfig::read(&settings.home.config_file()).await?;
                let mut text = String::new();
                for (k, v) in cfg.values() {
                    match v {
                        serde_json::Value::String(s) => text.push_str(&format!("- {}: {}\n", k, s)),
                        other => text.push_str(&format!("- {}: {}\n", k, other)),
                    }
                }
                out.raw(&text);
            }
        }
        Ok(0)
    }
}
