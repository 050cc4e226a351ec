//! Vulnerability scanning of addon images.
//!
//! The upstream addon list maps every addon to its images. Each image is
//! scanned with `trivy` and the findings are recorded in `status.yaml`,
//! where an addon is enabled when none of its images carries a critical
//! CVE. Manual overrides made with [`toggle`] survive rescans.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::command::{Cmd, Runner};
use crate::reason;

/// `{addon: {logical name: image}}` as published upstream.
pub type AddonList = BTreeMap<String, BTreeMap<String, String>>;

pub const CRITICAL: &str = "CRITICAL";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Cve {
    pub name: String,
    pub package_name: String,
    pub severity: String,
    pub updated_version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageStatus {
    pub image: String,
    #[serde(rename = "CVEs")]
    pub cves: Vec<Cve>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddonStatus {
    pub enabled: bool,
    pub manual: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub manual_reason: String,
    pub images: Vec<ImageStatus>,
}

pub type StatusFile = BTreeMap<String, AddonStatus>;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID", default)]
    id: String,
    #[serde(rename = "PkgName", default)]
    package: String,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "FixedVersion", default)]
    fixed_version: String,
}

/// Reads the addon list from a URL or a local file.
pub async fn fetch_addon_list(source: &str) -> anyhow::Result<AddonList> {
    let body = if source.starts_with("http://") || source.starts_with("https://") {
        let resp = reqwest::get(source)
            .await
            .with_context(|| format!("fetching {}", source))?;
        if !resp.status().is_success() {
            anyhow::bail!("fetching {}: {}", source, resp.status());
        }
        resp.text().await?
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("reading {}", source))?
    };
    serde_yaml::from_str(&body).with_context(|| format!("parsing addon list from {}", source))
}

/// Parses the JSON report of `trivy image --format json`.
pub fn parse_report(json: &[u8]) -> anyhow::Result<Vec<Cve>> {
    let report: TrivyReport = serde_json::from_slice(json).context("parsing scanner report")?;
    Ok(report
        .results
        .into_iter()
        .flat_map(|r| r.vulnerabilities.unwrap_or_default())
        .map(|v| Cve {
            name: v.id,
            package_name: v.package,
            severity: v.severity,
            updated_version: v.fixed_version,
        })
        .collect())
}

/// Scans one image with `trivy` on the host behind `runner`.
#[instrument(level = "info", skip(runner))]
pub async fn scan_image(runner: &dyn Runner, image: &str) -> anyhow::Result<Vec<Cve>> {
    let res = runner
        .run(Cmd::new("trivy").args(["image", "--format", "json", "--quiet", image]))
        .await
        .with_context(|| format!("scanning {}", image))?;
    parse_report(&res.stdout)
}

async fn read_status(path: &Path) -> anyhow::Result<StatusFile> {
    match tokio::fs::read(path).await {
        Ok(data) if data.is_empty() => Ok(StatusFile::new()),
        Ok(data) => serde_yaml::from_slice(&data).with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusFile::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_status(path: &Path, status: &StatusFile) -> anyhow::Result<()> {
    let data = serde_yaml::to_string(status)?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Scans every image of every addon and rewrites `status_path`.
///
/// An image that fails to scan is recorded without findings and reported
/// as a warning.
pub async fn scan(runner: &dyn Runner, addons: &AddonList, status_path: &Path) -> anyhow::Result<StatusFile> {
    let previous = read_status(status_path).await?;
    let mut status = StatusFile::new();
    for (addon, images) in addons {
        let mut entry = AddonStatus::default();
        for image in images.values() {
            let cves = match scan_image(runner, image).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(%addon, %image, error = %e, "scan failed");
                    Vec::new()
                }
            };
            entry.images.push(ImageStatus {
                image: image.clone(),
                cves,
            });
        }
        let clean = !entry
            .images
            .iter()
            .flat_map(|i| &i.cves)
            .any(|c| c.severity == CRITICAL);
        match previous.get(addon) {
            Some(prev) if prev.manual => {
                entry.manual = true;
                entry.manual_reason = prev.manual_reason.clone();
                entry.enabled = prev.enabled;
            }
            _ => entry.enabled = clean,
        }
        info!(%addon, enabled = entry.enabled, "scanned");
        status.insert(addon.clone(), entry);
    }
    write_status(status_path, &status).await?;
    Ok(status)
}

/// Overrides an addon's scanned state. Disabling requires a reason.
pub async fn toggle(status_path: &Path, addon: &str, enable: bool, why: &str) -> anyhow::Result<()> {
    if !enable && why.trim().is_empty() {
        return Err(reason::usage("a reason is required to disable an addon"));
    }
    let mut status = read_status(status_path).await?;
    let entry = status.entry(addon.to_string()).or_default();
    entry.enabled = enable;
    entry.manual = true;
    entry.manual_reason = why.to_string();
    write_status(status_path, &status).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::fake::FakeRunner;

    const REPORT: &str = r#"{
        "SchemaVersion": 2,
        "Results": [
            {"Target": "alpine", "Vulnerabilities": [
                {"VulnerabilityID": "CVE-2023-0001", "PkgName": "openssl", "Severity": "CRITICAL", "FixedVersion": "3.0.8"},
                {"VulnerabilityID": "CVE-2023-0002", "PkgName": "zlib", "Severity": "LOW"}
            ]},
            {"Target": "app", "Vulnerabilities": null}
        ]
    }"#;

    fn addons() -> AddonList {
        serde_yaml::from_str(
            "registry:\n  Registry: docker.io/registry:2.8.3\nmetallb:\n  Controller: quay.io/metallb/controller:v0.9.6\n",
        )
        .expect("yaml")
    }

    #[test]
    fn reports_are_flattened() {
        let cves = parse_report(REPORT.as_bytes()).expect("parse");
        assert_eq!(cves.len(), 2);
        assert_eq!(cves[0].name, "CVE-2023-0001");
        assert_eq!(cves[0].updated_version, "3.0.8");
        assert_eq!(cves[1].updated_version, "");
    }

    #[tokio::test]
    async fn critical_findings_disable_an_addon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.yaml");
        let runner = FakeRunner::default().respond("registry:2.8.3", REPORT, 0);
        let status = scan(&runner, &addons(), &path).await.expect("scan");
        assert!(!status["registry"].enabled);
        assert!(status["metallb"].enabled);
        let written = std::fs::read_to_string(&path).expect("read");
        assert!(written.contains("CVEs:"));
        assert!(written.contains("PackageName: openssl"));
    }

    #[tokio::test]
    async fn manual_overrides_survive_rescans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.yaml");
        assert!(toggle(&path, "metallb", false, "  ").await.is_err());
        toggle(&path, "metallb", false, "pending upstream fix").await.expect("toggle");
        let runner = FakeRunner::default();
        let status = scan(&runner, &addons(), &path).await.expect("scan");
        assert!(!status["metallb"].enabled);
        assert!(status["metallb"].manual);
        assert_eq!(status["metallb"].manual_reason, "pending upstream fix");
    }
}
