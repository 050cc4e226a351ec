//! Bundled cluster addons.
//!
//! Each addon is a set of manifest templates rendered from the cluster
//! config and applied inside the guest with the cluster's own kubectl.
//! Whether an addon is enabled is recorded in the profile.
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry, ExponentialBackoffStrategy, RetryPolicy};
use crate::command::{Asset, Cmd, Runner};
use crate::config::{ClusterConfig, Store};
use crate::constants::vmpath;
use crate::out::{Icon, Out};
use crate::reason;

pub mod configure;
mod manifests;
pub mod scan;

pub const STORAGE_PROVISIONER: &str = "storage-provisioner";
pub const DEFAULT_STORAGECLASS: &str = "default-storageclass";
pub const DASHBOARD: &str = "dashboard";
pub const INGRESS: &str = "ingress";
pub const METALLB: &str = "metallb";
pub const REGISTRY_CREDS: &str = "registry-creds";
pub const REGISTRY_ALIASES: &str = "registry-aliases";
pub const AUTO_PAUSE: &str = "auto-pause";

const AUTO_PAUSE_UNIT_DIR: &str = "/etc/systemd/system";

/// An image pulled by an addon.
#[derive(Clone, Copy, Debug)]
pub struct AddonImage {
    /// The name templates refer to, as in `{{.Images.Registry}}`.
    pub logical: &'static str,
    pub registry: &'static str,
    pub image: &'static str,
}

impl AddonImage {
    /// The full reference, honoring an image repository override.
    pub fn reference(&self, image_repository: &str) -> String {
        if !image_repository.is_empty() {
            return format!("{}/{}", image_repository.trim_end_matches('/'), self.image);
        }
        if self.registry.is_empty() {
            self.image.to_string()
        } else {
            format!("{}/{}", self.registry, self.image)
        }
    }
}

/// A manifest template and where it lands in the guest.
#[derive(Clone, Copy, Debug)]
pub struct Template {
    pub body: &'static str,
    pub target_dir: &'static str,
    pub target_name: &'static str,
    pub permissions: &'static str,
}

const fn manifest(body: &'static str, target_name: &'static str) -> Template {
    Template {
        body,
        target_dir: vmpath::GUEST_ADDONS_DIR,
        target_name,
        permissions: "0640",
    }
}

/// One bundled addon.
#[derive(Debug)]
pub struct Bundle {
    pub name: &'static str,
    pub maintainer: &'static str,
    pub templates: &'static [Template],
    pub images: &'static [AddonImage],
    pub default_enabled: bool,
}

impl Bundle {
    fn applied(&self) -> impl Iterator<Item = &Template> {
        self.templates
            .iter()
            .filter(|t| t.target_name.ends_with(".yaml"))
    }
}

const fn image(logical: &'static str, registry: &'static str, image: &'static str) -> AddonImage {
    AddonImage {
        logical,
        registry,
        image,
    }
}

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\{\{\s*\.([A-Za-z0-9_.]+)\s*\}\}").expect("static regex");
}

/// Every bundled addon, sorted by name.
pub static BUNDLES: &[Bundle] = &[
    Bundle {
        name: AUTO_PAUSE,
        maintainer: "minikube",
        templates: &[
            Template {
                body: manifests::AUTO_PAUSE_UNIT,
                target_dir: AUTO_PAUSE_UNIT_DIR,
                target_name: "auto-pause.service",
                permissions: "0644",
            },
            manifest(manifests::AUTO_PAUSE_HOOK, "auto-pause-hook.yaml"),
        ],
        images: &[image("AutoPauseHook", "gcr.io", "k8s-minikube/auto-pause-hook:v0.0.5")],
        default_enabled: false,
    },
    Bundle {
        name: "csi-hostpath-driver",
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::CSI_HOSTPATH_DRIVER, "csi-hostpath-driver.yaml")],
        images: &[
            image("HostPathPlugin", "registry.k8s.io", "sig-storage/hostpathplugin:v1.9.0"),
            image("Provisioner", "registry.k8s.io", "sig-storage/csi-provisioner:v3.3.0"),
            image("Snapshotter", "registry.k8s.io", "sig-storage/csi-snapshotter:v6.1.0"),
        ],
        default_enabled: false,
    },
    Bundle {
        name: DASHBOARD,
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::DASHBOARD, "dashboard.yaml")],
        images: &[
            image("Dashboard", "docker.io", "kubernetesui/dashboard:v2.7.0"),
            image("MetricsScraper", "docker.io", "kubernetesui/metrics-scraper:v1.0.8"),
        ],
        default_enabled: false,
    },
    Bundle {
        name: DEFAULT_STORAGECLASS,
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::DEFAULT_STORAGECLASS, "storageclass.yaml")],
        images: &[],
        default_enabled: true,
    },
    Bundle {
        name: "gcp-auth",
        maintainer: "Google",
        templates: &[manifest(manifests::GCP_AUTH, "gcp-auth-webhook.yaml")],
        images: &[image("GCPAuthWebhook", "gcr.io", "k8s-minikube/gcp-auth-webhook:v0.1.0")],
        default_enabled: false,
    },
    Bundle {
        name: INGRESS,
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::INGRESS, "ingress-deploy.yaml")],
        images: &[image("IngressController", "registry.k8s.io", "ingress-nginx/controller:v1.9.4")],
        default_enabled: false,
    },
    Bundle {
        name: "ingress-dns",
        maintainer: "minikube",
        templates: &[manifest(manifests::INGRESS_DNS, "ingress-dns-pod.yaml")],
        images: &[image("IngressDNS", "gcr.io", "k8s-minikube/minikube-ingress-dns:0.0.2")],
        default_enabled: false,
    },
    Bundle {
        name: METALLB,
        maintainer: "MetalLB",
        templates: &[manifest(manifests::METALLB, "metallb.yaml")],
        images: &[
            image("Controller", "quay.io", "metallb/controller:v0.9.6"),
            image("Speaker", "quay.io", "metallb/speaker:v0.9.6"),
        ],
        default_enabled: false,
    },
    Bundle {
        name: "metrics-server",
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::METRICS_SERVER, "metrics-server.yaml")],
        images: &[image("MetricsServer", "registry.k8s.io", "metrics-server/metrics-server:v0.6.4")],
        default_enabled: false,
    },
    Bundle {
        name: "registry",
        maintainer: "minikube",
        templates: &[manifest(manifests::REGISTRY, "registry.yaml")],
        images: &[image("Registry", "docker.io", "registry:2.8.3")],
        default_enabled: false,
    },
    Bundle {
        name: REGISTRY_ALIASES,
        maintainer: "3rd party (unknown)",
        templates: &[manifest(manifests::REGISTRY_ALIASES, "registry-aliases.yaml")],
        images: &[
            image("Alpine", "docker.io", "alpine:3.11"),
            image("Pause", "registry.k8s.io", "pause:3.9"),
        ],
        default_enabled: false,
    },
    Bundle {
        name: REGISTRY_CREDS,
        maintainer: "3rd party (UPMC Enterprises)",
        templates: &[manifest(manifests::REGISTRY_CREDS, "registry-creds-rc.yaml")],
        images: &[image("RegistryCreds", "docker.io", "upmcenterprises/registry-creds:1.10")],
        default_enabled: false,
    },
    Bundle {
        name: STORAGE_PROVISIONER,
        maintainer: "minikube",
        templates: &[manifest(manifests::STORAGE_PROVISIONER, "storage-provisioner.yaml")],
        images: &[image("StorageProvisioner", "gcr.io", "k8s-minikube/storage-provisioner:v5")],
        default_enabled: true,
    },
    Bundle {
        name: "volumesnapshots",
        maintainer: "Kubernetes",
        templates: &[manifest(manifests::VOLUMESNAPSHOTS, "volumesnapshots.yaml")],
        images: &[image(
            "SnapshotController",
            "registry.k8s.io",
            "sig-storage/snapshot-controller:v6.1.0",
        )],
        default_enabled: false,
    },
];

/// Looks up a bundled addon by name.
pub fn find(name: &str) -> anyhow::Result<&'static Bundle> {
    BUNDLES.iter().find(|b| b.name == name).ok_or_else(|| {
        reason::with_kind(
            reason::INTERNAL_ADDON_ENABLE,
            anyhow::anyhow!(
                "{:?} is not a valid addon, run \"minikube addons list\" for the available addons",
                name
            ),
        )
    })
}

/// Template values for `cc`, including the resolved images of `bundle`.
pub fn params(cc: &ClusterConfig, bundle: &Bundle) -> BTreeMap<String, String> {
    let kc = &cc.kubernetes_config;
    let mut p = BTreeMap::new();
    p.insert("ContainerRuntime".to_string(), cc.container_runtime().to_string());
    p.insert("ImageRepository".to_string(), kc.image_repository.clone());
    p.insert("LoadBalancerStartIP".to_string(), kc.load_balancer_start_ip.clone());
    p.insert("LoadBalancerEndIP".to_string(), kc.load_balancer_end_ip.clone());
    p.insert("CustomIngressCert".to_string(), ingress_cert(&kc.custom_ingress_cert));
    p.insert("RegistryAliases".to_string(), kc.registry_aliases.clone());
    let interval = if cc.auto_pause_interval.is_zero() {
        configure::DEFAULT_AUTO_PAUSE_INTERVAL
    } else {
        cc.auto_pause_interval
    };
    p.insert("AutoPauseInterval".to_string(), configure::format_duration(interval));
    for img in bundle.images {
        p.insert(format!("Images.{}", img.logical), img.reference(&kc.image_repository));
    }
    p
}

fn ingress_cert(custom: &str) -> String {
    if custom.is_empty() {
        "$(POD_NAMESPACE)/ingress-nginx-admission".to_string()
    } else {
        custom.to_string()
    }
}

/// Replaces every `{{.Key}}` in `template` from `params`.
///
/// A key missing from `params` is an error rather than an empty string, so
/// a typo cannot produce a manifest that silently misbehaves.
pub fn render(template: &str, params: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let mut missing = Vec::new();
    let rendered = TOKEN.replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match params.get(key) {
            Some(v) => v.clone(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        anyhow::bail!("template references unknown values: {}", missing.join(", "));
    }
    Ok(rendered.into_owned())
}

/// The rendered assets of `bundle`.
pub fn assets(cc: &ClusterConfig, bundle: &Bundle) -> anyhow::Result<Vec<Asset>> {
    let p = params(cc, bundle);
    bundle
        .templates
        .iter()
        .map(|t| {
            let body = render(t.body, &p).with_context(|| format!("rendering {}", t.target_name))?;
            Ok(Asset::memory(body.into_bytes(), t.target_dir, t.target_name, t.permissions))
        })
        .collect()
}

/// One row of `addons list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub name: &'static str,
    pub profile: String,
    pub enabled: bool,
    pub maintainer: &'static str,
}

pub fn list(cc: &ClusterConfig) -> Vec<Listing> {
    BUNDLES
        .iter()
        .map(|b| Listing {
            name: b.name,
            profile: cc.name.clone(),
            enabled: cc.addon_enabled(b.name),
            maintainer: b.maintainer,
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JsonListing<'a> {
    status: &'a str,
    profile: &'a str,
}

/// `addons list --output=json`.
pub fn list_json(cc: &ClusterConfig) -> anyhow::Result<String> {
    let rows = list(cc);
    let map: BTreeMap<&str, JsonListing> = rows
        .iter()
        .map(|r| {
            (
                r.name,
                JsonListing {
                    status: if r.enabled { "enabled" } else { "disabled" },
                    profile: &r.profile,
                },
            )
        })
        .collect();
    Ok(serde_json::to_string(&map)?)
}

/// `addons list` as a table.
pub fn list_table(cc: &ClusterConfig) -> String {
    let rows = list(cc);
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(10).max(10);
    let mut s = format!(
        "|{:<w$}|{:<10}|{:<10}|{:<30}|\n",
        "ADDON NAME",
        "PROFILE",
        "STATUS",
        "MAINTAINER",
        w = width
    );
    for r in rows {
        let status = if r.enabled { "enabled ✅" } else { "disabled" };
        s.push_str(&format!(
            "|{:<w$}|{:<10}|{:<10}|{:<30}|\n",
            r.name,
            r.profile,
            status,
            r.maintainer,
            w = width
        ));
    }
    s
}

/// `(logical name, image)` pairs of an addon.
pub fn images(cc: &ClusterConfig, name: &str) -> anyhow::Result<Vec<(String, String)>> {
    let bundle = find(name)?;
    Ok(bundle
        .images
        .iter()
        .map(|i| {
            (
                i.logical.to_string(),
                i.reference(&cc.kubernetes_config.image_repository),
            )
        })
        .collect())
}

/// Addons that `start` enables: the defaults unless explicitly disabled,
/// every addon already enabled in the profile and the ones in `additional`.
pub fn to_enable(cc: &ClusterConfig, additional: &[String]) -> Vec<String> {
    let mut names: Vec<String> = BUNDLES
        .iter()
        .filter(|b| match cc.addons.get(b.name) {
            Some(enabled) => *enabled,
            None => b.default_enabled,
        })
        .map(|b| b.name.to_string())
        .collect();
    for a in additional {
        if !names.contains(a) {
            names.push(a.clone());
        }
    }
    names
}

fn check_supported(cc: &ClusterConfig, bundle: &Bundle) -> anyhow::Result<()> {
    if bundle.name == AUTO_PAUSE && cc.nodes.len() > 1 {
        return Err(reason::with_kind(
            reason::ADDON_UNSUPPORTED,
            anyhow::anyhow!("the auto-pause addon is only supported on single node clusters"),
        ));
    }
    if bundle.name == AUTO_PAUSE && cc.driver == "none" {
        return Err(reason::with_kind(
            reason::ADDON_UNSUPPORTED,
            anyhow::anyhow!("the auto-pause addon is not supported with the none driver"),
        ));
    }
    Ok(())
}

fn kubectl(cc: &ClusterConfig, verb: &str, files: &[String], force: bool) -> Cmd {
    let mut cmd = Cmd::sudo(format!("KUBECONFIG={}", vmpath::GUEST_KUBECONFIG))
        .arg(format!(
            "{}/{}/kubectl",
            vmpath::GUEST_BINARIES_DIR,
            cc.kubernetes_config.kubernetes_version
        ))
        .arg(verb);
    if force {
        cmd = cmd.arg("--force");
    }
    if verb == "delete" {
        cmd = cmd.arg("--ignore-not-found");
    }
    for f in files {
        cmd = cmd.arg("-f").arg(f.clone());
    }
    cmd
}

/// Installs or removes `bundle` in the guest behind `runner`.
#[instrument(level = "info", skip(runner, cc, bundle), fields(addon = bundle.name))]
pub async fn apply(runner: &dyn Runner, cc: &ClusterConfig, bundle: &Bundle, enable: bool) -> anyhow::Result<()> {
    let assets = assets(cc, bundle)?;
    let files: Vec<String> = bundle
        .applied()
        .map(|t| format!("{}/{}", t.target_dir, t.target_name))
        .collect();
    if enable {
        for a in &assets {
            runner.copy(a).await?;
        }
        if bundle.name == AUTO_PAUSE {
            runner.run(Cmd::sudo("systemctl").arg("daemon-reload")).await?;
            runner
                .run(Cmd::sudo("systemctl").args(["enable", "--now", "auto-pause"]))
                .await?;
        }
        if files.is_empty() {
            return Ok(());
        }
        let mut attempt = 0;
        let mut backoff = ExponentialBackoffStrategy::new(Duration::from_millis(250), Duration::from_secs(10));
        retry(
            &format!("apply {}", bundle.name),
            &mut backoff,
            RetryPolicy::deadline(Duration::from_secs(120)),
            || {
                attempt += 1;
                let cmd = kubectl(cc, "apply", &files, attempt > 1);
                async move { runner.run(cmd).await.map(|_| ()) }
            },
        )
        .await
        .map_err(|e| reason::with_kind(reason::INTERNAL_ADDON_ENABLE, e))?;
    } else {
        if !files.is_empty() {
            if let Err(e) = runner.run(kubectl(cc, "delete", &files, false)).await {
                warn!(error = %e, "kubectl delete failed, removing manifests anyway");
            }
        }
        if bundle.name == AUTO_PAUSE {
            let _ = runner
                .run(Cmd::sudo("systemctl").args(["disable", "--now", "auto-pause"]))
                .await;
        }
        for a in &assets {
            runner.remove(a).await?;
        }
    }
    Ok(())
}

/// Enables or disables `name` for the profile in `cc` and saves the profile.
///
/// When `runner` is `None` the cluster is not running and only the recorded
/// state changes; the addon is applied on the next start.
pub async fn set(
    store: &Store,
    runner: Option<&dyn Runner>,
    cc: &mut ClusterConfig,
    name: &str,
    enable: bool,
    out: &Out,
) -> anyhow::Result<()> {
    let bundle = find(name)?;
    if enable {
        check_supported(cc, bundle)?;
    }
    if cc.addon_enabled(name) == enable {
        debug!(addon = name, enable, "addon already in requested state, reapplying");
    }
    match runner {
        Some(r) => apply(r, cc, bundle, enable).await?,
        None => info!(addon = name, "cluster is not running, recording addon state only"),
    }
    cc.addons.insert(name.to_string(), enable);
    store.save(&cc.name, cc).await?;
    if enable {
        out.step(Icon::Enabling, format!("The '{}' addon is enabled", name));
        if name == REGISTRY_CREDS {
            out.info(
                Icon::Tip,
                "registry-creds needs credentials, run \"minikube addons configure registry-creds\"",
            );
        }
    } else {
        out.step(Icon::Check, format!("\"{}\" was successfully disabled", name));
    }
    Ok(())
}

/// Enables every addon in `names` concurrently. Failures are warnings.
pub async fn enable_all(runner: &dyn Runner, cc: &ClusterConfig, names: &[String], out: &Out) -> Vec<String> {
    let tasks = names.iter().map(|n| async move {
        let res = match find(n) {
            Ok(b) => match check_supported(cc, b) {
                Ok(()) => apply(runner, cc, b, true).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        (n.clone(), res)
    });
    let mut enabled = Vec::new();
    for (name, res) in futures::future::join_all(tasks).await {
        match res {
            Ok(()) => enabled.push(name),
            Err(e) => out.warning(format!("Enabling '{}' returned an error: {:#}", name, e)),
        }
    }
    if !enabled.is_empty() {
        out.step(Icon::Enabling, format!("Enabled addons: {}", enabled.join(", ")));
    }
    enabled
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn bundles_are_sorted_and_render() {
        let names: Vec<&str> = BUNDLES.iter().map(|b| b.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        let mut cc = ClusterConfig::new("p1");
        cc.kubernetes_config.load_balancer_start_ip = "10.0.0.1".to_string();
        cc.kubernetes_config.load_balancer_end_ip = "10.0.0.9".to_string();
        for b in BUNDLES {
            assets(&cc, b).unwrap_or_else(|e| panic!("{} failed to render: {:#}", b.name, e));
        }
    }

    #[test]
    fn unknown_template_keys_fail() {
        let p = BTreeMap::new();
        assert!(render("image: {{.Images.Nope}}", &p).is_err());
        let mut p = BTreeMap::new();
        p.insert("A".to_string(), "x".to_string());
        assert_eq!(render("{{.A}}-{{ .A }}", &p).expect("render"), "x-x");
    }

    #[test]
    fn image_repository_overrides_registry() {
        let mut cc = ClusterConfig::new("p1");
        let imgs = images(&cc, "metrics-server").expect("images");
        assert_eq!(
            imgs,
            vec![(
                "MetricsServer".to_string(),
                "registry.k8s.io/metrics-server/metrics-server:v0.6.4".to_string()
            )]
        );
        cc.kubernetes_config.image_repository = "mirror.example.com/k8s/".to_string();
        let imgs = images(&cc, "metrics-server").expect("images");
        assert_eq!(imgs[0].1, "mirror.example.com/k8s/metrics-server/metrics-server:v0.6.4");
        let err = images(&cc, "bogus").expect_err("unknown addon");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_ADDON_ENABLE"));
    }

    #[test]
    fn metallb_range_is_rendered() {
        let mut cc = ClusterConfig::new("p1");
        cc.kubernetes_config.load_balancer_start_ip = "192.168.49.100".to_string();
        cc.kubernetes_config.load_balancer_end_ip = "192.168.49.120".to_string();
        let a = assets(&cc, find(METALLB).expect("metallb")).expect("assets");
        let body = match &a[0].source {
            crate::command::AssetSource::Memory(b) => String::from_utf8(b.clone()).expect("utf8"),
            other => panic!("unexpected source {:?}", other),
        };
        assert!(body.contains("- 192.168.49.100-192.168.49.120"));
    }

    #[test]
    fn defaults_and_user_choices_are_enabled() {
        let mut cc = ClusterConfig::new("p1");
        assert_eq!(to_enable(&cc, &[]), vec![DEFAULT_STORAGECLASS, STORAGE_PROVISIONER]);
        cc.addons.insert(DEFAULT_STORAGECLASS.to_string(), false);
        cc.addons.insert(DASHBOARD.to_string(), true);
        assert_eq!(
            to_enable(&cc, &["ingress".to_string()]),
            vec![DASHBOARD, STORAGE_PROVISIONER, INGRESS]
        );
    }

    #[test]
    fn json_listing() {
        let mut cc = ClusterConfig::new("p1");
        cc.addons.insert(DASHBOARD.to_string(), true);
        let v: serde_json::Value = serde_json::from_str(&list_json(&cc).expect("json")).expect("parse");
        assert_eq!(v["dashboard"]["Status"], "enabled");
        assert_eq!(v["dashboard"]["Profile"], "p1");
        assert_eq!(v["ingress"]["Status"], "disabled");
    }

    #[tokio::test]
    async fn enable_copies_then_applies() {
        let runner = FakeRunner::default();
        let cc = ClusterConfig::new("p1");
        apply(&runner, &cc, find(DASHBOARD).expect("dashboard"), true)
            .await
            .expect("enable");
        let cmds = runner.commands();
        assert!(cmds[0].contains("sudo tee /etc/kubernetes/addons/dashboard.yaml"));
        assert!(cmds[1].starts_with("sudo KUBECONFIG=/var/lib/minikube/kubeconfig"));
        assert!(cmds[1].contains("kubectl apply -f /etc/kubernetes/addons/dashboard.yaml"));
    }

    #[tokio::test]
    async fn disable_deletes_then_removes() {
        let runner = FakeRunner::default();
        let cc = ClusterConfig::new("p1");
        apply(&runner, &cc, find("registry").expect("registry"), false)
            .await
            .expect("disable");
        let cmds = runner.commands();
        assert!(cmds[0].contains("kubectl delete --ignore-not-found -f /etc/kubernetes/addons/registry.yaml"));
        assert_eq!(cmds[1], "sudo rm -f /etc/kubernetes/addons/registry.yaml");
    }

    #[tokio::test]
    async fn auto_pause_installs_a_unit() {
        let runner = FakeRunner::default();
        let mut cc = ClusterConfig::new("p1");
        cc.auto_pause_interval = Duration::from_secs(90);
        apply(&runner, &cc, find(AUTO_PAUSE).expect("auto-pause"), true)
            .await
            .expect("enable");
        let cmds = runner.commands();
        assert!(cmds[0].contains("/etc/systemd/system/auto-pause.service"));
        assert!(cmds.iter().any(|c| c == "sudo systemctl enable --now auto-pause"));
        let seen = runner.seen.lock().expect("lock");
        let unit = String::from_utf8(seen[0].stdin.clone().unwrap_or_default()).expect("utf8");
        assert!(unit.contains("--interval=1m30s"));
        assert!(unit.contains("--container-runtime=docker"));
    }

    #[tokio::test]
    async fn disabled_cluster_only_records_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(crate::localpath::MiniHome::new(dir.path()));
        let mut cc = ClusterConfig::new("p1");
        store.save("p1", &cc).await.expect("save");
        set(&store, None, &mut cc, INGRESS, true, &Out::default())
            .await
            .expect("set");
        let loaded = store.load("p1").await.expect("load");
        assert!(loaded.addon_enabled(INGRESS));
    }

    #[tokio::test]
    async fn auto_pause_refuses_multinode() {
        let runner = FakeRunner::default();
        let mut cc = ClusterConfig::new("p1");
        cc.nodes = vec![Default::default(), Default::default()];
        let enabled = enable_all(&runner, &cc, &[AUTO_PAUSE.to_string()], &Out::default()).await;
        assert!(enabled.is_empty());
        assert!(runner.commands().is_empty());
    }
}
