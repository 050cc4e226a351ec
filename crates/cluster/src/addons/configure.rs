//! `addons configure`: interactive settings for addons that need them.
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{apply, find, AUTO_PAUSE, INGRESS, METALLB, REGISTRY_ALIASES, REGISTRY_CREDS};
use crate::command::{Cmd, Runner};
use crate::config::{ClusterConfig, Store};
use crate::kubeconfig;
use crate::out::{Icon, Out};
use crate::reason;

pub const DEFAULT_AUTO_PAUSE_INTERVAL: Duration = Duration::from_secs(60);

/// Placeholder stored for credentials the user did not provide.
pub const CHANGE_ME: &str = "changeme";
/// Placeholder used by older releases for the same purpose.
pub const DEFAULT_VALUE: &str = "MINIKUBE_DEFAULT_VALUE";
pub const SENTINEL_LABEL: &str = "minikube.sigs.k8s.io/sentinel";
const DEFAULT_GCR_URL: &str = "https://gcr.io";

lazy_static! {
    static ref INGRESS_CERT: Regex = Regex::new(r"^.+/.+$").expect("static regex");
    static ref ALIASES: Regex = Regex::new(
        r"^([a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+)+(\ [a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+)*$"
    )
    .expect("static regex");
    static ref DURATION_PART: Regex = Regex::new(r"^([0-9]*\.?[0-9]+)(h|ms|us|µs|ns|m|s)").expect("static regex");
}

/// Asks the user for values.
pub trait Prompt: Send {
    /// Reads one answer, returning `default` for an empty reply.
    fn ask(&mut self, question: &str, default: &str) -> anyhow::Result<String>;

    fn confirm(&mut self, question: &str) -> anyhow::Result<bool> {
        let answer = self.ask(&format!("{} [y/n]", question), "n")?;
        Ok(answer.starts_with('y') || answer.starts_with('Y'))
    }
}

/// Prompts on the terminal.
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question: &str, default: &str) -> anyhow::Result<String> {
        print!("-- {}: ", question);
        std::io::stdout().flush()?;
        let mut response = String::new();
        std::io::stdin()
            .read_line(&mut response)
            .context("reading response")?;
        let response = response.trim();
        Ok(if response.is_empty() {
            default.to_string()
        } else {
            response.to_string()
        })
    }
}

/// What `configure` operates on.
pub struct Env<'a> {
    pub store: &'a Store,
    /// The primary control plane's runner, `None` when the cluster is down.
    pub runner: Option<&'a dyn Runner>,
    pub kubeconfig: &'a Path,
    pub out: &'a Out,
    /// Answers read from a JSON file instead of prompting.
    pub config_file: Option<&'a Path>,
}

/// Runs the settings dialog of addon `name` and applies the result.
pub async fn configure(
    env: &Env<'_>,
    cc: &mut ClusterConfig,
    name: &str,
    prompt: &mut dyn Prompt,
) -> anyhow::Result<()> {
    find(name)?;
    match name {
        REGISTRY_CREDS => {
            let creds = match env.config_file {
                Some(path) => RegistryCreds::from_file(path).await?,
                None => RegistryCreds::prompt(prompt).await?,
            };
            if !cc.addon_enabled(REGISTRY_CREDS) {
                env.out.warning("registry-creds was configured but is not enabled");
            }
            let client = kubeconfig::client(env.kubeconfig, &cc.name)
                .await
                .map_err(|e| reason::with_kind(reason::INTERNAL_KUBERNETES_CLIENT, e))?;
            create_secrets(client, &creds.secrets()).await?;
        }
        METALLB => {
            let kc = &mut cc.kubernetes_config;
            let start = prompt.ask("Enter Load Balancer Start IP", &kc.load_balancer_start_ip)?;
            let end = prompt.ask("Enter Load Balancer End IP", &kc.load_balancer_end_ip)?;
            validate_ip_range(&start, &end)?;
            kc.load_balancer_start_ip = start;
            kc.load_balancer_end_ip = end;
            save_and_reapply(env, cc, METALLB).await?;
        }
        INGRESS => {
            let current = cc.kubernetes_config.custom_ingress_cert.clone();
            if !current.is_empty()
                && !prompt.confirm(&format!("A custom cert ({}) is already set. Do you want to overwrite it?", current))?
            {
                return Ok(());
            }
            let cert = prompt.ask("Enter custom cert (format is \"namespace/secret\")", "")?;
            if !INGRESS_CERT.is_match(&cert) {
                return Err(reason::usage(format!(
                    "{:?} is not a valid custom cert, use the format namespace/secret",
                    cert
                )));
            }
            cc.kubernetes_config.custom_ingress_cert = cert;
            save_and_reapply(env, cc, INGRESS).await?;
        }
        AUTO_PAUSE => {
            let current = if cc.auto_pause_interval.is_zero() {
                DEFAULT_AUTO_PAUSE_INTERVAL
            } else {
                cc.auto_pause_interval
            };
            let answer = prompt.ask("Enter auto-pause interval", &format_duration(current))?;
            let interval = parse_duration(&answer)?;
            if interval.is_zero() {
                return Err(reason::usage("the auto-pause interval must be greater than 0s"));
            }
            cc.auto_pause_interval = interval;
            save_and_reapply(env, cc, AUTO_PAUSE).await?;
            if let (true, Some(r)) = (cc.addon_enabled(AUTO_PAUSE), env.runner) {
                r.run(Cmd::sudo("systemctl").args(["restart", "auto-pause"])).await?;
            }
        }
        REGISTRY_ALIASES => {
            let aliases = prompt.ask(
                "Enter registry aliases separated by space",
                &cc.kubernetes_config.registry_aliases,
            )?;
            if !ALIASES.is_match(&aliases) {
                return Err(reason::usage(format!(
                    "{:?} is not a valid list of registry aliases, separate host names by a single space",
                    aliases
                )));
            }
            cc.kubernetes_config.registry_aliases = aliases;
            save_and_reapply(env, cc, REGISTRY_ALIASES).await?;
        }
        other => {
            env.out
                .info(Icon::Notice, format!("{} has no available configuration options", other));
            return Ok(());
        }
    }
    env.out
        .step(Icon::Check, format!("{} was successfully configured", name));
    Ok(())
}

async fn save_and_reapply(env: &Env<'_>, cc: &ClusterConfig, name: &str) -> anyhow::Result<()> {
    env.store.save(&cc.name, cc).await?;
    match (cc.addon_enabled(name), env.runner) {
        (true, Some(r)) => {
            debug!(addon = name, "reapplying reconfigured addon");
            apply(r, cc, find(name)?, true).await
        }
        _ => Ok(()),
    }
}

fn validate_ip_range(start: &str, end: &str) -> anyhow::Result<()> {
    let s: IpAddr = start
        .parse()
        .map_err(|_| reason::usage(format!("invalid IP address {:?}", start)))?;
    let e: IpAddr = end
        .parse()
        .map_err(|_| reason::usage(format!("invalid IP address {:?}", end)))?;
    if s.is_ipv4() != e.is_ipv4() || s > e {
        return Err(reason::usage(format!("{} - {} is not a valid address range", start, end)));
    }
    Ok(())
}

/// Credentials for the registry-creds addon. Unset values hold [`CHANGE_ME`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryCreds {
    #[serde(rename = "awsAccessID")]
    pub aws_access_id: String,
    #[serde(rename = "awsAccessKey")]
    pub aws_access_key: String,
    #[serde(rename = "awsSessionToken")]
    pub aws_session_token: String,
    #[serde(rename = "awsRegion")]
    pub aws_region: String,
    #[serde(rename = "awsAccount")]
    pub aws_account: String,
    #[serde(rename = "awsRole")]
    pub aws_role: String,
    #[serde(rename = "gcrApplicationDefaultCredentials")]
    pub gcr_credentials: String,
    #[serde(rename = "gcrURL")]
    pub gcr_url: String,
    #[serde(rename = "dockerServer")]
    pub docker_server: String,
    #[serde(rename = "dockerUser")]
    pub docker_user: String,
    #[serde(rename = "dockerPass")]
    pub docker_password: String,
    #[serde(rename = "acrURL")]
    pub acr_url: String,
    #[serde(rename = "acrClientID")]
    pub acr_client_id: String,
    #[serde(rename = "acrPassword")]
    pub acr_password: String,
}

impl Default for RegistryCreds {
    fn default() -> Self {
        let c = || CHANGE_ME.to_string();
        RegistryCreds {
            aws_access_id: c(),
            aws_access_key: c(),
            aws_session_token: String::new(),
            aws_region: c(),
            aws_account: c(),
            aws_role: c(),
            gcr_credentials: c(),
            gcr_url: DEFAULT_GCR_URL.to_string(),
            docker_server: c(),
            docker_user: c(),
            docker_password: c(),
            acr_url: c(),
            acr_client_id: c(),
            acr_password: c(),
        }
    }
}

impl RegistryCreds {
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut creds: RegistryCreds = serde_json::from_slice(&data)
            .map_err(|e| reason::usage(format!("{} is not a valid registry-creds config: {}", path.display(), e)))?;
        if creds.gcr_credentials != CHANGE_ME && !creds.gcr_credentials.is_empty() {
            creds.gcr_credentials = read_gcr_credentials(&creds.gcr_credentials).await?;
        }
        Ok(creds)
    }

    pub async fn prompt(p: &mut dyn Prompt) -> anyhow::Result<Self> {
        let mut c = RegistryCreds::default();
        if p.confirm("Do you want to enable AWS Elastic Container Registry?")? {
            c.aws_access_id = p.ask("Enter AWS Access Key ID", CHANGE_ME)?;
            c.aws_access_key = p.ask("Enter AWS Secret Access Key", CHANGE_ME)?;
            c.aws_session_token = p.ask("(Optional) Enter AWS Session Token", "")?;
            c.aws_region = p.ask("Enter AWS Region", CHANGE_ME)?;
            c.aws_account = p.ask("Enter 12 digit AWS Account ID (Comma separated list)", CHANGE_ME)?;
            c.aws_role = p.ask("(Optional) Enter ARN of AWS role to assume", CHANGE_ME)?;
        }
        if p.confirm("Do you want to enable Google Container Registry?")? {
            let path = p.ask("Enter path to credentials (e.g. /home/user/.config/gcloud/application_default_credentials.json)", "")?;
            c.gcr_credentials = read_gcr_credentials(&path).await?;
            if p.confirm(&format!("Do you want to change the GCR URL (Default {})?", DEFAULT_GCR_URL))? {
                c.gcr_url = p.ask("Enter GCR URL (e.g. https://asia.gcr.io)", DEFAULT_GCR_URL)?;
            }
        }
        if p.confirm("Do you want to enable Docker Registry?")? {
            c.docker_server = p.ask("Enter docker registry server url", CHANGE_ME)?;
            c.docker_user = p.ask("Enter docker registry username", CHANGE_ME)?;
            c.docker_password = p.ask("Enter docker registry password", CHANGE_ME)?;
        }
        if p.confirm("Do you want to enable Azure Container Registry?")? {
            c.acr_url = p.ask("Enter Azure Container Registry (ACR) URL", CHANGE_ME)?;
            c.acr_client_id = p.ask("Enter client ID (service principal ID) to access ACR", CHANGE_ME)?;
            c.acr_password = p.ask("Enter service principal password to access Azure Container Registry", CHANGE_ME)?;
        }
        Ok(c)
    }

    /// The four secrets read by the registry-creds controller.
    pub fn secrets(&self) -> Vec<Secret> {
        vec![
            creds_secret(
                "ecr",
                &[
                    ("AWS_ACCESS_KEY_ID", &self.aws_access_id),
                    ("AWS_SECRET_ACCESS_KEY", &self.aws_access_key),
                    ("AWS_SESSION_TOKEN", &self.aws_session_token),
                    ("aws-account", &self.aws_account),
                    ("aws-region", &self.aws_region),
                    ("aws-assume-role", &self.aws_role),
                ],
            ),
            creds_secret(
                "gcr",
                &[
                    ("application_default_credentials.json", &self.gcr_credentials),
                    ("gcrurl", &self.gcr_url),
                ],
            ),
            creds_secret(
                "dpr",
                &[
                    ("DOCKER_PRIVATE_REGISTRY_SERVER", &self.docker_server),
                    ("DOCKER_PRIVATE_REGISTRY_USER", &self.docker_user),
                    ("DOCKER_PRIVATE_REGISTRY_PASSWORD", &self.docker_password),
                ],
            ),
            creds_secret(
                "acr",
                &[
                    ("ACR_URL", &self.acr_url),
                    ("ACR_CLIENT_ID", &self.acr_client_id),
                    ("ACR_PASSWORD", &self.acr_password),
                ],
            ),
        ]
    }
}

async fn read_gcr_credentials(path: &str) -> anyhow::Result<String> {
    let path = shellexpand_home(path);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading GCR credentials from {}", path))
}

fn shellexpand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

fn is_sentinel(value: &str) -> bool {
    value == CHANGE_ME || value == DEFAULT_VALUE
}

fn creds_secret(cloud: &str, data: &[(&str, &String)]) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "registry-creds".to_string());
    labels.insert("cloud".to_string(), cloud.to_string());
    labels.insert("kubernetes.io/minikube-addons".to_string(), "registry-creds".to_string());
    if data.iter().any(|(_, v)| is_sentinel(v)) {
        labels.insert(SENTINEL_LABEL.to_string(), "true".to_string());
    }
    let mut secret = Secret::default();
    secret.metadata.name = Some(format!("registry-creds-{}", cloud));
    secret.metadata.namespace = Some("kube-system".to_string());
    secret.metadata.labels = Some(labels);
    secret.type_ = Some("Opaque".to_string());
    secret.string_data = Some(
        data.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    secret
}

/// Whether a registry-creds secret still holds placeholder values.
pub fn is_sentinel_secret(secret: &Secret) -> bool {
    secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(SENTINEL_LABEL))
        .map_or(false, |v| v == "true")
}

async fn create_secrets(client: kube::Client, secrets: &[Secret]) -> anyhow::Result<()> {
    let api: Api<Secret> = Api::namespaced(client, "kube-system");
    for secret in secrets {
        let name = secret.metadata.name.clone().unwrap_or_default();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!(%name, "replaced existing secret"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e).with_context(|| format!("deleting secret {}", name)),
        }
        api.create(&PostParams::default(), secret)
            .await
            .with_context(|| format!("creating secret {}", name))?;
        if is_sentinel_secret(secret) {
            info!(%name, "secret holds placeholder credentials and will be ignored");
        }
    }
    Ok(())
}

/// Parses durations such as `1m0s`, `90s` or `1h30m`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let mut rest = s;
    let mut total = 0f64;
    if rest.is_empty() {
        return Err(reason::usage("empty duration"));
    }
    while !rest.is_empty() {
        let caps = DURATION_PART
            .captures(rest)
            .ok_or_else(|| reason::usage(format!("invalid duration {:?}", s)))?;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| reason::usage(format!("invalid duration {:?}", s)))?;
        let unit = match &caps[2] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            _ => 1e-9,
        };
        total += value * unit;
        rest = &rest[caps[0].len()..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration the way `parse_duration` reads it, e.g. `1m30s`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        let ms = d.as_secs_f64() * 1000.0;
        return format!("{}ms", trim_float(ms));
    }
    let total = d.as_secs();
    let (h, m) = (total / 3600, (total % 3600) / 60);
    let secs = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;
    let s = format!("{}s", trim_float(secs));
    match (h, m) {
        (0, 0) => s,
        (0, m) => format!("{}m{}", m, s),
        (h, m) => format!("{}h{}m{}", h, m, s),
    }
}

fn trim_float(v: f64) -> String {
    let s = format!("{:.9}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}
