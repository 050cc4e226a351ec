//! The audit log of minikube invocations, one JSON event per line in
//! `<home>/logs/audit.json`.
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Settings;

/// Audit entries kept when the log is rewritten.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

const TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %Z";
const EVENT_TYPE: &str = "io.k8s.sigs.minikube.audit";

/// Commands that never reach the audit log.
const UNLOGGED: [&str; 6] = ["", "status", "version", "completion", "help", "options"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub args: String,
    pub command: String,
    pub end_time: String,
    pub profile: String,
    pub start_time: String,
    pub user: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Event {
    data: Row,
    datacontenttype: String,
    id: String,
    source: String,
    specversion: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Whether an invocation is recorded. `delete --purge` is not, since it
/// removes the log itself.
pub fn should_log(command: &str, args: &[String]) -> bool {
    if UNLOGGED.contains(&command) {
        return false;
    }
    !(command == "delete" && args.iter().any(|a| a == "--purge"))
}

/// The user recorded for an invocation: the `--user` flag, or the login.
pub fn user_name(flag: &str) -> String {
    if !flag.is_empty() {
        return flag.to_string();
    }
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Records the start of a command, returning the id to finish it with.
pub async fn log_command_start(
    settings: &Settings,
    command: &str,
    args: &[String],
) -> anyhow::Result<Option<String>> {
    if settings.skip_audit || !should_log(command, args) {
        return Ok(None);
    }
    let id = uuid::Uuid::new_v4().to_string();
    let row = Row {
        args: args.join(" "),
        command: command.to_string(),
        end_time: String::new(),
        profile: settings.profile.clone(),
        start_time: chrono::Local::now().format(TIME_FORMAT).to_string(),
        user: user_name(&settings.user),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    append(&settings.home.audit_log(), &event(id.clone(), row)).await?;
    debug!(%id, %command, "audit entry recorded");
    Ok(Some(id))
}

/// Stamps the end time on the entry `id` and trims the log to
/// `max_entries`.
pub async fn log_command_end(settings: &Settings, id: &str, max_entries: usize) -> anyhow::Result<()> {
    let path = settings.home.audit_log();
    let data = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut events: Vec<Event> = data
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let entry = events
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| anyhow::anyhow!("failed to find a log row with id equals to {}", id))?;
    entry.data.end_time = chrono::Local::now().format(TIME_FORMAT).to_string();

    let skip = events.len().saturating_sub(max_entries);
    let mut out = String::new();
    for e in events.iter().skip(skip) {
        out.push_str(&serde_json::to_string(e)?);
        out.push('\n');
    }
    tokio::fs::write(&path, out)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Reads every row of the log.
pub async fn rows(path: &Path) -> anyhow::Result<Vec<Row>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    Ok(data
        .lines()
        .filter_map(|l| serde_json::from_str::<Event>(l).ok())
        .map(|e| e.data)
        .collect())
}

fn event(id: String, data: Row) -> Event {
    Event {
        data,
        datacontenttype: "application/json".to_string(),
        id,
        source: "https://minikube.sigs.k8s.io/".to_string(),
        specversion: "1.0".to_string(),
        kind: EVENT_TYPE.to_string(),
    }
}

async fn append(path: &Path, e: &Event) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut line = serde_json::to_string(e)?;
    line.push('\n');
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    f.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::localpath::MiniHome;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn which_commands_are_logged() {
        assert!(should_log("start", &[]));
        assert!(should_log("delete", &[]));
        assert!(!should_log("status", &[]));
        assert!(!should_log("version", &[]));
        assert!(!should_log("", &[]));
        assert!(!should_log("delete", &args(&["--purge"])));
    }

    #[test]
    fn user_flag_wins() {
        assert_eq!(user_name("testUser"), "testUser");
    }

    #[tokio::test]
    async fn start_end_and_trim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::new(MiniHome::new(dir.path()));
        let mut last = None;
        for _ in 0..4 {
            last = log_command_start(&settings, "start", &args(&["-p", "minikube"]))
                .await
                .expect("start");
        }
        let id = last.expect("start is logged");
        log_command_end(&settings, &id, 3).await.expect("end");

        let rows = rows(&settings.home.audit_log()).await.expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].args, "-p minikube");
        assert!(!rows[2].end_time.is_empty());
        assert!(rows[0].end_time.is_empty());

        assert!(log_command_end(&settings, "non-existing-id", 3).await.is_err());
    }

    #[tokio::test]
    async fn skip_audit_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::new(MiniHome::new(dir.path()));
        settings.skip_audit = true;
        let id = log_command_start(&settings, "start", &[]).await.expect("start");
        assert!(id.is_none());
        assert!(!settings.home.audit_log().exists());
    }
}
