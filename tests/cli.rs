//! Runs the `minikube` binary against a throwaway home directory.
use std::path::Path;
use std::process::Output;

use cluster::config::{ClusterConfig, Node, Store};
use cluster::localpath::MiniHome;
use tokio::process::Command;

struct Home {
    dir: tempfile::TempDir,
}

impl Home {
    fn new() -> Self {
        Home {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn minikube_home(&self) -> MiniHome {
        MiniHome::new(self.root().join(".minikube"))
    }

    async fn minikube(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_minikube"));
        cmd.args(args)
            .env("MINIKUBE_HOME", self.root())
            .env("KUBECONFIG", self.root().join("kubeconfig"))
            .env("HOME", self.root())
            .env_remove("RUST_LOG")
            .env_remove("MACHINE_STORAGE_PATH");
        for (key, _) in std::env::vars() {
            if (key.starts_with("MINIKUBE_") && key != "MINIKUBE_HOME") || key.starts_with("DOCKER_") {
                cmd.env_remove(key);
            }
        }
        cmd.output().await.expect("running minikube")
    }

    /// Saves a single-node profile whose machine was never created.
    async fn profile_without_machine(&self, name: &str) {
        let mut cc = ClusterConfig::new(name);
        cc.driver = "kvm2".to_string();
        cc.nodes.push(Node {
            control_plane: true,
            worker: true,
            kubernetes_version: cc.kubernetes_config.kubernetes_version.clone(),
            ip: "192.168.39.2".to_string(),
            port: 8443,
            ..Default::default()
        });
        Store::new(self.minikube_home())
            .save(name, &cc)
            .await
            .expect("save profile");
    }
}

fn stdout(o: &Output) -> String {
    String::from_utf8_lossy(&o.stdout).into_owned()
}

fn stderr(o: &Output) -> String {
    String::from_utf8_lossy(&o.stderr).into_owned()
}

#[tokio::test]
async fn profile_list_starts_empty() {
    let home = Home::new();
    let out = home.minikube(&["profile", "list", "-o", "json"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let list: serde_json::Value = serde_json::from_str(stdout(&out).trim()).expect("json");
    assert_eq!(list["valid"], serde_json::json!([]));
    assert_eq!(list["invalid"], serde_json::json!([]));
}

#[tokio::test]
async fn profile_switches_the_active_profile() {
    let home = Home::new();
    home.profile_without_machine("dev").await;

    let out = home.minikube(&["profile"]).await;
    assert_eq!(stdout(&out).trim(), "minikube");

    let out = home.minikube(&["profile", "dev"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let out = home.minikube(&["profile"]).await;
    assert_eq!(stdout(&out).trim(), "dev");

    let out = home.minikube(&["profile", "list", "-o", "json"]).await;
    let list: serde_json::Value = serde_json::from_str(stdout(&out).trim()).expect("json");
    assert_eq!(list["valid"][0]["Name"], "dev");
    assert_eq!(list["valid"][0]["Active"], true);
}

#[tokio::test]
async fn config_values_persist_between_runs() {
    let home = Home::new();
    let out = home.minikube(&["config", "set", "cpus", "4"]).await;
    assert!(out.status.success(), "{}", stderr(&out));

    let out = home.minikube(&["config", "get", "cpus"]).await;
    assert_eq!(stdout(&out).trim(), "4");

    let out = home.minikube(&["config", "view"]).await;
    assert!(stdout(&out).contains("- cpus: 4"), "{}", stdout(&out));

    let out = home.minikube(&["config", "unset", "cpus"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let out = home.minikube(&["config", "get", "cpus"]).await;
    assert!(!out.status.success());
}

#[tokio::test]
async fn bad_config_values_are_usage_errors() {
    let home = Home::new();
    let out = home.minikube(&["config", "set", "cpus", "four"]).await;
    assert_eq!(out.status.code(), Some(14), "{}", stderr(&out));

    let out = home.minikube(&["config", "set", "no-such-key", "1"]).await;
    assert_eq!(out.status.code(), Some(14), "{}", stderr(&out));
    assert!(stderr(&out).contains("no-such-key"));
}

#[tokio::test]
async fn status_of_a_missing_profile_is_not_found() {
    let home = Home::new();
    let out = home.minikube(&["-p", "ghost", "status"]).await;
    assert_eq!(out.status.code(), Some(85), "{}", stderr(&out));
    assert!(stderr(&out).contains("ghost"));
    assert_eq!(stderr(&out).matches("GUEST_NOT_FOUND").count(), 1, "{}", stderr(&out));
}

#[tokio::test]
async fn status_of_a_machineless_profile_is_nonexistent() {
    let home = Home::new();
    home.profile_without_machine("p1").await;

    let out = home.minikube(&["-p", "p1", "status", "-o", "json"]).await;
    assert_eq!(out.status.code(), Some(7), "{}", stderr(&out));
    let st: serde_json::Value = serde_json::from_str(stdout(&out).trim()).expect("json");
    assert_eq!(st["Host"], "Nonexistent");
    assert_eq!(st["APIServer"], "Nonexistent");
}

#[tokio::test]
async fn status_rejects_format_with_output() {
    let home = Home::new();
    home.profile_without_machine("p1").await;
    let out = home
        .minikube(&["-p", "p1", "status", "-o", "json", "--format", "{{.Host}}"])
        .await;
    assert_eq!(out.status.code(), Some(14), "{}", stderr(&out));
}

#[tokio::test]
async fn delete_converges_on_partial_state() {
    let home = Home::new();
    home.profile_without_machine("p1").await;

    let out = home.minikube(&["-p", "p1", "delete"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(!home.minikube_home().profile("p1").exists());

    // Deleting again warns but still succeeds.
    let out = home.minikube(&["-p", "p1", "delete"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stderr(&out).contains("does not exist"));
}

#[tokio::test]
async fn delete_removes_corrupt_profiles() {
    let home = Home::new();
    let mh = home.minikube_home();
    tokio::fs::create_dir_all(mh.profile("broken")).await.expect("mkdir");
    tokio::fs::write(mh.profile_config("broken"), b"{\"Name\": ").await.expect("write");

    let out = home.minikube(&["profile", "list", "-o", "json"]).await;
    let list: serde_json::Value = serde_json::from_str(stdout(&out).trim()).expect("json");
    assert_eq!(list["invalid"][0]["Name"], "broken");

    let out = home.minikube(&["delete", "--all"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(!mh.profile("broken").exists());
}

#[tokio::test]
async fn docker_env_unset_needs_no_cluster() {
    let home = Home::new();
    let out = home.minikube(&["-p", "ghost", "docker-env", "--unset", "--shell", "bash"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let script = stdout(&out);
    assert!(script.contains("unset DOCKER_TLS_VERIFY;"), "{}", script);
    assert!(script.contains("unset DOCKER_HOST;"), "{}", script);
    assert!(script.contains("unset MINIKUBE_ACTIVE_DOCKERD;"), "{}", script);
}

#[tokio::test]
async fn docker_env_of_a_missing_profile_is_not_found() {
    let home = Home::new();
    let out = home.minikube(&["-p", "ghost", "docker-env", "--shell", "bash"]).await;
    assert_eq!(out.status.code(), Some(85), "{}", stderr(&out));
}

#[tokio::test]
async fn failures_are_reported_as_json_events() {
    let home = Home::new();
    let out = home.minikube(&["-p", "ghost", "ip", "-o", "json"]).await;
    assert_eq!(out.status.code(), Some(85));
    let event = stderr(&out)
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|v| v["data"]["name"] == "GUEST_NOT_FOUND")
        .unwrap_or_else(|| panic!("no error event in {}", stderr(&out)));
    assert_eq!(event["data"]["exitcode"], "85");
}

#[tokio::test]
async fn commands_are_audited() {
    let home = Home::new();
    let out = home.minikube(&["config", "view"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let log = tokio::fs::read_to_string(home.minikube_home().audit_log())
        .await
        .expect("audit log");
    assert!(log.contains("config"), "{}", log);

    let out = home.minikube(&["--skip-audit", "profile"]).await;
    assert!(out.status.success(), "{}", stderr(&out));
    let after = tokio::fs::read_to_string(home.minikube_home().audit_log())
        .await
        .expect("audit log");
    assert_eq!(log.lines().count(), after.lines().count());
}
