//! `minikube profile` and `minikube profile list`.
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::user::{UserConfig, PROFILE};
use crate::config::{validate_profile_name, ClusterConfig, Profile, ProfileList, Settings};
use crate::constants;
use crate::kubeconfig;
use crate::localpath::MiniHome;
use crate::out::Icon;
use crate::reason;

use super::status::{self, node_status};

/// The status shown for a profile: its primary control plane's host state,
/// or its apiserver state once the host runs.
pub async fn profile_status(home: &MiniHome, cc: &ClusterConfig, kubeconfig_path: &std::path::Path) -> String {
    let primary = match cc.primary_control_plane() {
        Ok(n) => n,
        Err(_) => return status::NONEXISTENT.to_string(),
    };
    match node_status(home, cc, &primary, kubeconfig_path).await {
        Ok(st) if st.host == status::RUNNING => st.apiserver,
        Ok(st) => st.host,
        Err(e) => {
            debug!(profile = %cc.name, error = %e, "profile status");
            "Error".to_string()
        }
    }
}

/// The active profile named by the user config, or the default one.
pub async fn active(home: &MiniHome) -> String {
    match UserConfig::read(&home.config_file()).await {
        Ok(cfg) => cfg
            .get_str(PROFILE)
            .filter(|p| !p.is_empty())
            .unwrap_or(constants::DEFAULT_CLUSTER_NAME)
            .to_string(),
        Err(_) => constants::DEFAULT_CLUSTER_NAME.to_string(),
    }
}

/// Every profile with its status. Invalid profiles keep an empty status.
pub async fn list(settings: &Settings) -> anyhow::Result<ProfileList> {
    let mut list = settings.store().list().await?;
    let current = active(&settings.home).await;
    for p in list.valid.iter_mut() {
        p.active = p.name == current;
        if let Some(cc) = &p.config {
            p.status = profile_status(&settings.home, cc, &settings.kubeconfig).await;
        }
    }
    for p in list.invalid.iter_mut() {
        p.active = p.name == current;
    }
    Ok(list)
}

#[derive(Serialize)]
struct ProfileListJson<'a> {
    valid: &'a [Profile],
    invalid: &'a [Profile],
}

/// `profile list --output=json`.
pub fn render_json(list: &ProfileList) -> anyhow::Result<String> {
    serde_json::to_string(&ProfileListJson {
        valid: &list.valid,
        invalid: &list.invalid,
    })
    .map_err(|e| reason::with_kind(reason::INTERNAL_STATUS_JSON, e))
}

fn row(p: &Profile) -> Vec<String> {
    let cc = match &p.config {
        Some(cc) => cc,
        None => return vec![p.name.clone()],
    };
    let primary = cc.primary_control_plane().unwrap_or_default();
    let name = if p.active {
        format!("{} *", p.name)
    } else {
        p.name.clone()
    };
    vec![
        name,
        cc.driver.clone(),
        cc.container_runtime().to_string(),
        primary.ip.clone(),
        if primary.port == 0 { cc.api_server_port } else { primary.port }.to_string(),
        cc.kubernetes_config.kubernetes_version.clone(),
        p.status.clone(),
        cc.nodes.len().to_string(),
    ]
}

/// `profile list` as a table.
pub fn render_table(list: &ProfileList) -> String {
    let header: Vec<String> = ["Profile", "VM Driver", "Runtime", "IP", "Port", "Version", "Status", "Nodes"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let rows: Vec<Vec<String>> = list.valid.iter().map(row).collect();
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for r in &rows {
        for (i, cell) in r.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let line = |cells: &[String]| {
        let mut s = String::from("|");
        for (i, w) in widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            s.push_str(&format!(" {:<w$} |", cell, w = *w));
        }
        s.push('\n');
        s
    };
    let mut s = line(&header);
    s.push('|');
    for w in &widths {
        s.push_str(&"-".repeat(w + 2));
        s.push('|');
    }
    s.push('\n');
    for r in &rows {
        s.push_str(&line(r));
    }
    s
}

/// Warnings for profiles that failed to load.
pub fn invalid_notice(list: &ProfileList) -> Option<String> {
    if list.invalid.is_empty() {
        return None;
    }
    let names: Vec<&str> = list.invalid.iter().map(|p| p.name.as_str()).collect();
    Some(format!(
        "Found {} invalid profile(s) ! \n\t{}\nYou can delete them using the following command(s): \n\t$ minikube delete -p {}",
        names.len(),
        names.join("\n\t"),
        names.join("\n\t$ minikube delete -p ")
    ))
}

/// `minikube profile <name>`: makes `name` the active profile and points
/// the kubeconfig at it.
pub async fn set_active(settings: &Settings, name: &str) -> anyhow::Result<()> {
    let out = settings.out();
    validate_profile_name(name)?;
    if !settings.store().exists(name).await {
        out.warning(format!(
            "if you want to create a profile you can by this command: minikube start -p {}",
            name
        ));
    }
    UserConfig::update(&settings.home, |cfg| cfg.set(PROFILE, name))
        .await
        .map_err(|e| reason::with_kind(reason::HOST_SAVE_PROFILE, e))?;

    let keep_context = settings
        .store()
        .load(name)
        .await
        .map(|cc| cc.keep_context)
        .unwrap_or(false);
    if !keep_context {
        if let Err(e) = kubeconfig::set_current_context(&settings.kubeconfig, name).await {
            warn!(profile = name, error = %e, "setting current context");
            out.warning(format!("Error while setting kubectl current context: {}", e));
        }
    }
    out.step(Icon::Check, format!("minikube profile was successfully set to {}", name));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut s = Settings::new(MiniHome::new(dir.join(".minikube")));
        s.kubeconfig = dir.join("kubeconfig");
        s.output = crate::out::Format::Json;
        s
    }

    #[tokio::test]
    async fn lists_profiles_with_their_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        settings
            .store()
            .save("p1", &cluster("p1", "kvm2", 1))
            .await
            .expect("save");
        std::fs::create_dir_all(settings.home.profile("broken")).expect("mkdir");

        let list = list(&settings).await.expect("list");
        assert_eq!(list.valid.len(), 1);
        assert_eq!(list.valid[0].status, status::NONEXISTENT);
        assert_eq!(list.invalid[0].name, "broken");

        let table = render_table(&list);
        assert!(table.starts_with("| Profile |"));
        assert!(table.contains("| kvm2 "));
        assert!(table.contains("| 2 "));
        let json: serde_json::Value = serde_json::from_str(&render_json(&list).expect("json")).expect("parse");
        assert_eq!(json["valid"][0]["Name"], "p1");
        assert_eq!(json["invalid"][0]["Name"], "broken");
        assert!(invalid_notice(&list).expect("notice").contains("minikube delete -p broken"));
    }

    #[tokio::test]
    async fn setting_the_active_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        assert_eq!(active(&settings.home).await, "minikube");
        set_active(&settings, "dev").await.expect("set");
        assert_eq!(active(&settings.home).await, "dev");
        let err = set_active(&settings, "Not Valid").await.expect_err("invalid");
        assert!(format!("{:#}", err).contains("Not Valid"));
    }
}
