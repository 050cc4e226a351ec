//! Failure classification.
//!
//! Every fatal error that reaches the binary is turned into a [`Kind`]: a
//! stable identifier, a process exit code and a piece of actionable advice.
//! Errors that already carry a kind travel as [`ExitError`]; anything else is
//! matched against the catalog of known issues in [`known_issues`].

use std::fmt;

use serde::Serialize;

mod known_issues;

pub use known_issues::{host_os, match_known_issue, Match, KNOWN_ISSUES};

const ISSUE_BASE: &str = "https://github.com/kubernetes/minikube/issues";

/// Process exit codes.
///
/// Codes are grouped in blocks of ten by the layer that failed; within a
/// block the last digit says what went wrong (see the `*_OFFSET` constants).
pub mod exit {
    /// General failure.
    pub const FAILURE: i32 = 1;
    /// Interrupted by a signal.
    pub const INTERRUPTED: i32 = 2;

    pub const ERROR_OFFSET: i32 = 0;
    pub const CONFLICT_OFFSET: i32 = 1;
    pub const TIMEOUT_OFFSET: i32 = 2;
    pub const NOT_RUNNING_OFFSET: i32 = 3;
    pub const USAGE_OFFSET: i32 = 4;
    pub const NOT_FOUND_OFFSET: i32 = 5;
    pub const UNSUPPORTED_OFFSET: i32 = 6;
    pub const PERMISSION_OFFSET: i32 = 7;
    pub const CONFIG_OFFSET: i32 = 8;
    pub const UNAVAILABLE_OFFSET: i32 = 9;

    pub const PROGRAM: i32 = 10;
    pub const RESOURCE: i32 = 20;
    pub const HOST: i32 = 30;
    pub const INTERNET: i32 = 40;
    pub const DRIVER: i32 = 50;
    pub const PROVIDER: i32 = 60;
    pub const LOCAL_NETWORK: i32 = 70;
    pub const GUEST: i32 = 80;
    pub const RUNTIME: i32 = 90;
    pub const CONTROL_PLANE: i32 = 100;
    pub const SERVICE: i32 = 110;

    pub const PROGRAM_ERROR: i32 = PROGRAM + ERROR_OFFSET;
    pub const PROGRAM_CONFLICT: i32 = PROGRAM + CONFLICT_OFFSET;
    pub const PROGRAM_USAGE: i32 = PROGRAM + USAGE_OFFSET;
    pub const PROGRAM_NOT_FOUND: i32 = PROGRAM + NOT_FOUND_OFFSET;
    pub const PROGRAM_UNSUPPORTED: i32 = PROGRAM + UNSUPPORTED_OFFSET;
    pub const PROGRAM_CONFIG: i32 = PROGRAM + CONFIG_OFFSET;

    pub const RESOURCE_ERROR: i32 = RESOURCE;
    pub const INSUFFICIENT_MEMORY: i32 = 23;
    pub const INSUFFICIENT_STORAGE: i32 = 26;
    pub const INSUFFICIENT_PERMISSION: i32 = 27;
    pub const INSUFFICIENT_CORES: i32 = 29;

    pub const HOST_ERROR: i32 = HOST + ERROR_OFFSET;
    pub const HOST_CONFLICT: i32 = HOST + CONFLICT_OFFSET;
    pub const HOST_TIMEOUT: i32 = HOST + TIMEOUT_OFFSET;
    pub const HOST_USAGE: i32 = HOST + USAGE_OFFSET;
    pub const HOST_NOT_FOUND: i32 = HOST + NOT_FOUND_OFFSET;
    pub const HOST_UNSUPPORTED: i32 = HOST + UNSUPPORTED_OFFSET;
    pub const HOST_PERMISSION: i32 = HOST + PERMISSION_OFFSET;
    pub const HOST_CONFIG: i32 = HOST + CONFIG_OFFSET;

    pub const INTERNET_ERROR: i32 = INTERNET + ERROR_OFFSET;
    pub const INTERNET_CONFLICT: i32 = INTERNET + CONFLICT_OFFSET;
    pub const INTERNET_TIMEOUT: i32 = INTERNET + TIMEOUT_OFFSET;
    pub const INTERNET_NOT_FOUND: i32 = INTERNET + NOT_FOUND_OFFSET;
    pub const INTERNET_CONFIG: i32 = INTERNET + CONFIG_OFFSET;
    pub const INTERNET_UNAVAILABLE: i32 = INTERNET + UNAVAILABLE_OFFSET;

    pub const DRIVER_ERROR: i32 = DRIVER + ERROR_OFFSET;
    pub const DRIVER_CONFLICT: i32 = DRIVER + CONFLICT_OFFSET;
    pub const DRIVER_TIMEOUT: i32 = DRIVER + TIMEOUT_OFFSET;
    pub const DRIVER_USAGE: i32 = DRIVER + USAGE_OFFSET;
    pub const DRIVER_NOT_FOUND: i32 = DRIVER + NOT_FOUND_OFFSET;
    pub const DRIVER_UNSUPPORTED: i32 = DRIVER + UNSUPPORTED_OFFSET;
    pub const DRIVER_PERMISSION: i32 = DRIVER + PERMISSION_OFFSET;
    pub const DRIVER_CONFIG: i32 = DRIVER + CONFIG_OFFSET;
    pub const DRIVER_UNAVAILABLE: i32 = DRIVER + UNAVAILABLE_OFFSET;

    pub const PROVIDER_ERROR: i32 = PROVIDER + ERROR_OFFSET;
    pub const PROVIDER_CONFLICT: i32 = PROVIDER + CONFLICT_OFFSET;
    pub const PROVIDER_TIMEOUT: i32 = PROVIDER + TIMEOUT_OFFSET;
    pub const PROVIDER_NOT_RUNNING: i32 = PROVIDER + NOT_RUNNING_OFFSET;
    pub const PROVIDER_NOT_FOUND: i32 = PROVIDER + NOT_FOUND_OFFSET;
    pub const PROVIDER_UNSUPPORTED: i32 = PROVIDER + UNSUPPORTED_OFFSET;
    pub const PROVIDER_PERMISSION: i32 = PROVIDER + PERMISSION_OFFSET;
    pub const PROVIDER_CONFIG: i32 = PROVIDER + CONFIG_OFFSET;
    pub const PROVIDER_UNAVAILABLE: i32 = PROVIDER + UNAVAILABLE_OFFSET;

    pub const LOCAL_NETWORK_ERROR: i32 = LOCAL_NETWORK + ERROR_OFFSET;
    pub const LOCAL_NETWORK_CONFLICT: i32 = LOCAL_NETWORK + CONFLICT_OFFSET;
    pub const LOCAL_NETWORK_TIMEOUT: i32 = LOCAL_NETWORK + TIMEOUT_OFFSET;
    pub const LOCAL_NETWORK_NOT_FOUND: i32 = LOCAL_NETWORK + NOT_FOUND_OFFSET;
    pub const LOCAL_NETWORK_PERMISSION: i32 = LOCAL_NETWORK + PERMISSION_OFFSET;
    pub const LOCAL_NETWORK_CONFIG: i32 = LOCAL_NETWORK + CONFIG_OFFSET;
    pub const LOCAL_NETWORK_UNAVAILABLE: i32 = LOCAL_NETWORK + UNAVAILABLE_OFFSET;

    pub const GUEST_ERROR: i32 = GUEST + ERROR_OFFSET;
    pub const GUEST_CONFLICT: i32 = GUEST + CONFLICT_OFFSET;
    pub const GUEST_TIMEOUT: i32 = GUEST + TIMEOUT_OFFSET;
    pub const GUEST_NOT_RUNNING: i32 = GUEST + NOT_RUNNING_OFFSET;
    pub const GUEST_NOT_FOUND: i32 = GUEST + NOT_FOUND_OFFSET;
    pub const GUEST_UNSUPPORTED: i32 = GUEST + UNSUPPORTED_OFFSET;
    pub const GUEST_PERMISSION: i32 = GUEST + PERMISSION_OFFSET;
    pub const GUEST_CONFIG: i32 = GUEST + CONFIG_OFFSET;
    pub const GUEST_UNAVAILABLE: i32 = GUEST + UNAVAILABLE_OFFSET;

    pub const RUNTIME_ERROR: i32 = RUNTIME + ERROR_OFFSET;
    pub const RUNTIME_NOT_RUNNING: i32 = RUNTIME + NOT_RUNNING_OFFSET;
    pub const RUNTIME_NOT_FOUND: i32 = RUNTIME + NOT_FOUND_OFFSET;
    pub const RUNTIME_UNAVAILABLE: i32 = RUNTIME + UNAVAILABLE_OFFSET;

    pub const CONTROL_PLANE_ERROR: i32 = CONTROL_PLANE + ERROR_OFFSET;
    pub const CONTROL_PLANE_TIMEOUT: i32 = CONTROL_PLANE + TIMEOUT_OFFSET;
    pub const CONTROL_PLANE_NOT_RUNNING: i32 = CONTROL_PLANE + NOT_RUNNING_OFFSET;
    pub const CONTROL_PLANE_NOT_FOUND: i32 = CONTROL_PLANE + NOT_FOUND_OFFSET;
    pub const CONTROL_PLANE_UNSUPPORTED: i32 = CONTROL_PLANE + UNSUPPORTED_OFFSET;
    pub const CONTROL_PLANE_CONFIG: i32 = CONTROL_PLANE + CONFIG_OFFSET;
    pub const CONTROL_PLANE_UNAVAILABLE: i32 = CONTROL_PLANE + UNAVAILABLE_OFFSET;

    pub const SERVICE_ERROR: i32 = SERVICE + ERROR_OFFSET;
    pub const SERVICE_CONFLICT: i32 = SERVICE + CONFLICT_OFFSET;
    pub const SERVICE_TIMEOUT: i32 = SERVICE + TIMEOUT_OFFSET;
    pub const SERVICE_NOT_RUNNING: i32 = SERVICE + NOT_RUNNING_OFFSET;
    pub const SERVICE_NOT_FOUND: i32 = SERVICE + NOT_FOUND_OFFSET;
    pub const SERVICE_UNSUPPORTED: i32 = SERVICE + UNSUPPORTED_OFFSET;
    pub const SERVICE_PERMISSION: i32 = SERVICE + PERMISSION_OFFSET;
}

/// Icon family used when a kind is printed on a terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Failure,
    Usage,
    NotAllowed,
    Shrug,
    Conflict,
    UnmetRequirement,
    SeeNoEvil,
}

impl Style {
    /// The prefix printed in front of a message of this style.
    pub fn icon(self) -> &'static str {
        match self {
            Style::Failure => "❌",
            Style::Usage => "💡",
            Style::NotAllowed => "🚫",
            Style::Shrug => "🤷",
            Style::Conflict => "💢",
            Style::UnmetRequirement => "⛔",
            Style::SeeNoEvil => "🙈",
        }
    }
}

/// A classified failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Kind {
    /// Unique and stable identifier, e.g. `RT_DOCKER_EXIT_5`.
    pub id: &'static str,
    pub exit_code: i32,
    pub style: Style,
    /// Actionable text for the user. May contain `{{.name}}` placeholders.
    pub advice: &'static str,
    pub url: &'static str,
    /// Related upstream issue numbers.
    pub issues: &'static [u32],
    pub new_issue_link: bool,
    /// The caller insists on this classification; skip known-issue matching.
    pub no_match: bool,
}

impl Kind {
    pub const fn new(id: &'static str, exit_code: i32) -> Self {
        Kind {
            id,
            exit_code,
            style: Style::Failure,
            advice: "",
            url: "",
            issues: &[],
            new_issue_link: false,
            no_match: false,
        }
    }

    pub const fn advice(mut self, advice: &'static str) -> Self {
        self.advice = advice;
        self
    }

    pub const fn url(mut self, url: &'static str) -> Self {
        self.url = url;
        self
    }

    pub const fn issues(mut self, issues: &'static [u32]) -> Self {
        self.issues = issues;
        self
    }

    pub const fn style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub const fn new_issue_link(mut self) -> Self {
        self.new_issue_link = true;
        self
    }

    pub const fn no_match(mut self) -> Self {
        self.no_match = true;
        self
    }

    /// Links to the related upstream issues.
    pub fn issue_urls(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| format!("{}/{}", ISSUE_BASE, i))
            .collect()
    }

    /// Advice with `{{.key}}` placeholders replaced from `vars`.
    pub fn render_advice(&self, vars: &[(&str, &str)]) -> String {
        let mut advice = self.advice.to_string();
        for (key, value) in vars {
            advice = advice.replace(&format!("{{{{.{}}}}}", key), value);
        }
        advice
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

/// An error which already knows how it should be reported.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct ExitError {
    pub kind: Kind,
    #[source]
    pub source: anyhow::Error,
}

impl ExitError {
    pub fn new(kind: Kind, source: impl Into<anyhow::Error>) -> Self {
        ExitError {
            kind,
            source: source.into(),
        }
    }
}

/// Wraps an error with a kind so it survives `?` up to the binary.
pub fn with_kind(kind: Kind, source: impl Into<anyhow::Error>) -> anyhow::Error {
    ExitError::new(kind, source).into()
}

/// Returns an `anyhow` error classified as a usage error.
pub fn usage(msg: impl fmt::Display) -> anyhow::Error {
    with_kind(USAGE, anyhow::anyhow!("{}", msg))
}

/// The error chain joined with `: `, without the kind tags added by
/// [`with_kind`].
pub fn message(err: &anyhow::Error) -> String {
    err.chain()
        .filter(|e| !e.is::<ExitError>())
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// The kind an error was explicitly tagged with, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&Kind> {
    err.chain()
        .find_map(|e| e.downcast_ref::<ExitError>())
        .map(|e| &e.kind)
}

/// Picks the kind for a fatal error.
///
/// An error carrying an [`ExitError`] keeps its kind unless that kind allows
/// matching and the message matches a known issue. Unclassified errors get
/// [`PROGRAM_ERROR`].
pub fn classify(err: &anyhow::Error, os: &str) -> Kind {
    let requested = kind_of(err).cloned();
    let msg = message(err);
    match requested {
        Some(kind) => match_known_issue(&kind, &msg, os).unwrap_or(kind),
        None => match_known_issue(&PROGRAM_ERROR, &msg, os).unwrap_or(PROGRAM_ERROR),
    }
}

pub const PROGRAM_ERROR: Kind = Kind::new("MK_PROGRAM_ERROR", exit::PROGRAM_ERROR);
pub const USAGE: Kind = Kind::new("MK_USAGE", exit::PROGRAM_USAGE).no_match();
pub const INTERRUPTED: Kind = Kind::new("MK_INTERRUPTED", exit::INTERRUPTED).no_match();

pub const INTERNAL_ADDON_ENABLE: Kind = Kind::new("MK_ADDON_ENABLE", exit::PROGRAM_ERROR);
pub const INTERNAL_ADDON_DISABLE: Kind = Kind::new("MK_ADDON_DISABLE", exit::PROGRAM_ERROR);
pub const INTERNAL_BOOTSTRAPPER: Kind = Kind::new("MK_BOOTSTRAPPER", exit::PROGRAM_ERROR);
pub const INTERNAL_CACHE_LIST: Kind = Kind::new("MK_CACHE_LIST", exit::PROGRAM_ERROR);
pub const INTERNAL_CACHE_LOAD: Kind = Kind::new("MK_CACHE_LOAD", exit::PROGRAM_ERROR);
pub const INTERNAL_COMMAND_RUNNER: Kind = Kind::new("MK_COMMAND_RUNNER", exit::PROGRAM_ERROR);
pub const INTERNAL_CONFIG_SET: Kind = Kind::new("MK_CONFIG_SET", exit::PROGRAM_ERROR);
pub const INTERNAL_CONFIG_UNSET: Kind = Kind::new("MK_CONFIG_UNSET", exit::PROGRAM_ERROR);
pub const INTERNAL_ENV_SCRIPT: Kind = Kind::new("MK_ENV_SCRIPT", exit::PROGRAM_ERROR);
pub const INTERNAL_JSON_MARSHAL: Kind = Kind::new("MK_JSON_MARSHAL", exit::PROGRAM_ERROR);
pub const INTERNAL_KUBERNETES_CLIENT: Kind =
    Kind::new("MK_K8S_CLIENT", exit::CONTROL_PLANE_UNAVAILABLE);
pub const INTERNAL_NEW_RUNTIME: Kind = Kind::new("MK_NEW_RUNTIME", exit::PROGRAM_ERROR);
pub const INTERNAL_RESERVED_PROFILE: Kind =
    Kind::new("MK_RESERVED_PROFILE", exit::PROGRAM_CONFLICT).no_match();
pub const INTERNAL_SHELL_DETECT: Kind = Kind::new("MK_SHELL_DETECT", exit::PROGRAM_ERROR);
pub const INTERNAL_STATUS_JSON: Kind = Kind::new("MK_STATUS_JSON", exit::PROGRAM_ERROR);
pub const INTERNAL_SEMVER_PARSE: Kind = Kind::new("MK_SEMVER_PARSE", exit::PROGRAM_ERROR);

pub const RSRC_INSUFFICIENT_CORES: Kind =
    Kind::new("RSRC_INSUFFICIENT_CORES", exit::INSUFFICIENT_CORES)
        .style(Style::UnmetRequirement);
pub const RSRC_INSUFFICIENT_REQ_MEMORY: Kind =
    Kind::new("RSRC_INSUFFICIENT_REQ_MEMORY", exit::INSUFFICIENT_MEMORY)
        .style(Style::UnmetRequirement);
pub const RSRC_INSUFFICIENT_STORAGE: Kind =
    Kind::new("RSRC_INSUFFICIENT_STORAGE", exit::INSUFFICIENT_STORAGE)
        .style(Style::UnmetRequirement);

pub const HOST_HOME_MKDIR: Kind = Kind::new("HOST_HOME_MKDIR", exit::HOST_PERMISSION);
pub const HOST_CONFIG_LOAD: Kind = Kind::new("HOST_CONFIG_LOAD", exit::HOST_CONFIG);
pub const HOST_DEL_CACHE: Kind = Kind::new("HOST_DEL_CACHE", exit::HOST_ERROR);
pub const HOST_KILL_MOUNT_PROC: Kind = Kind::new("HOST_KILL_MOUNT_PROC", exit::HOST_ERROR);
pub const HOST_KUBECONFIG_UPDATE: Kind = Kind::new("HOST_KUBECONFIG_UPDATE", exit::HOST_CONFIG);
pub const HOST_KUBECONFIG_DELETE_CTX: Kind =
    Kind::new("HOST_KUBECONFIG_DELETE_CTX", exit::HOST_CONFIG);
pub const HOST_MOUNT_PID: Kind = Kind::new("HOST_MOUNT_PID", exit::HOST_ERROR);
pub const HOST_PATH_MISSING: Kind = Kind::new("HOST_PATH_MISSING", exit::HOST_NOT_FOUND);
pub const HOST_PURGE: Kind = Kind::new("HOST_PURGE", exit::HOST_ERROR);
pub const HOST_SAVE_PROFILE: Kind = Kind::new("HOST_SAVE_PROFILE", exit::HOST_CONFIG);

pub const DRV_CP_ENDPOINT: Kind = Kind::new("DRV_CP_ENDPOINT", exit::DRIVER_ERROR).advice(
    "Recreate the cluster by running:\n\tminikube delete {{.profile_arg}}\n\tminikube start {{.profile_arg}}",
);
pub const DRV_UNSUPPORTED_MULTINODE: Kind =
    Kind::new("DRV_UNSUPPORTED_MULTINODE", exit::DRIVER_CONFLICT);
pub const DRV_UNSUPPORTED_OS: Kind = Kind::new("DRV_UNSUPPORTED_OS", exit::DRIVER_UNSUPPORTED);
pub const DRV_NOT_FOUND: Kind = Kind::new("DRV_NOT_FOUND", exit::DRIVER_NOT_FOUND);
pub const DRV_NOT_DETECTED: Kind = Kind::new("DRV_NOT_DETECTED", exit::DRIVER_NOT_FOUND);
pub const DRV_NOT_HEALTHY: Kind = Kind::new("DRV_NOT_HEALTHY", exit::DRIVER_NOT_FOUND);
pub const DRV_AS_ROOT: Kind = Kind::new("DRV_AS_ROOT", exit::DRIVER_PERMISSION);
pub const DRV_NEEDS_ROOT: Kind = Kind::new("DRV_NEEDS_ROOT", exit::DRIVER_PERMISSION);

pub const GUEST_CACHE_LOAD: Kind = Kind::new("GUEST_CACHE_LOAD", exit::GUEST_ERROR);
pub const GUEST_CERT: Kind = Kind::new("GUEST_CERT", exit::GUEST_ERROR);
pub const GUEST_CP_CONFIG: Kind = Kind::new("GUEST_CP_CONFIG", exit::GUEST_CONFIG);
pub const GUEST_DELETION: Kind = Kind::new("GUEST_DELETION", exit::GUEST_ERROR);
pub const GUEST_LOAD_HOST: Kind = Kind::new("GUEST_LOAD_HOST", exit::GUEST_ERROR);
pub const GUEST_MOUNT: Kind = Kind::new("GUEST_MOUNT", exit::GUEST_ERROR);
pub const GUEST_MOUNT_CONFLICT: Kind = Kind::new("GUEST_MOUNT_CONFLICT", exit::GUEST_CONFLICT);
pub const GUEST_NODE_ADD: Kind = Kind::new("GUEST_NODE_ADD", exit::GUEST_ERROR);
pub const GUEST_NODE_DELETE: Kind = Kind::new("GUEST_NODE_DELETE", exit::GUEST_ERROR);
pub const GUEST_NODE_RETRIEVE: Kind = Kind::new("GUEST_NODE_RETRIEVE", exit::GUEST_NOT_FOUND);
pub const GUEST_NODE_START: Kind = Kind::new("GUEST_NODE_START", exit::GUEST_ERROR);
pub const GUEST_PAUSE: Kind = Kind::new("GUEST_PAUSE", exit::GUEST_ERROR);
pub const GUEST_PROFILE_DELETION: Kind = Kind::new("GUEST_PROFILE_DELETION", exit::GUEST_ERROR);
pub const GUEST_PROVISION: Kind = Kind::new("GUEST_PROVISION", exit::GUEST_ERROR);
pub const GUEST_START: Kind = Kind::new("GUEST_START", exit::GUEST_ERROR);
pub const GUEST_STATUS: Kind = Kind::new("GUEST_STATUS", exit::GUEST_ERROR);
pub const GUEST_STOP_TIMEOUT: Kind = Kind::new("GUEST_STOP_TIMEOUT", exit::GUEST_TIMEOUT);
pub const GUEST_UNPAUSE: Kind = Kind::new("GUEST_UNPAUSE", exit::GUEST_ERROR);
pub const GUEST_DRIVER_MISMATCH: Kind =
    Kind::new("GUEST_DRIVER_MISMATCH", exit::GUEST_CONFLICT).style(Style::Conflict);
pub const GUEST_NOT_FOUND: Kind = Kind::new("GUEST_NOT_FOUND", exit::GUEST_NOT_FOUND)
    .advice("Run \"minikube profile list\" to view all profiles.\nTo start a cluster, run: \"minikube start {{.profile_arg}}\"");
pub const GUEST_NOT_RUNNING: Kind = Kind::new("GUEST_NOT_RUNNING", exit::GUEST_NOT_RUNNING)
    .advice("To start a cluster, run: \"minikube start {{.profile_arg}}\"");

pub const IF_HOST_IP: Kind = Kind::new("IF_HOST_IP", exit::LOCAL_NETWORK_ERROR);
pub const IF_MOUNT_IP: Kind = Kind::new("IF_MOUNT_IP", exit::LOCAL_NETWORK_ERROR);
pub const IF_MOUNT_PORT: Kind = Kind::new("IF_MOUNT_PORT", exit::LOCAL_NETWORK_ERROR);
pub const IF_SSH_CLIENT: Kind = Kind::new("IF_SSH_CLIENT", exit::LOCAL_NETWORK_ERROR);

pub const INET_ADDON_LIST: Kind = Kind::new("INET_ADDON_LIST", exit::INTERNET_ERROR);
pub const INET_CACHE_BINARIES: Kind = Kind::new("INET_CACHE_BINARIES", exit::INTERNET_ERROR);
pub const INET_CACHE_KUBECTL: Kind = Kind::new("INET_CACHE_KUBECTL", exit::INTERNET_ERROR);
pub const INET_CACHE_TAR: Kind = Kind::new("INET_CACHE_TAR", exit::INTERNET_ERROR);

pub const RUNTIME_ENABLE: Kind = Kind::new("RUNTIME_ENABLE", exit::RUNTIME_ERROR);
pub const RUNTIME_CACHE: Kind = Kind::new("RUNTIME_CACHE", exit::RUNTIME_ERROR);

pub const SVC_TIMEOUT: Kind = Kind::new("SVC_TIMEOUT", exit::SERVICE_TIMEOUT);
pub const SVC_LIST: Kind = Kind::new("SVC_LIST", exit::SERVICE_ERROR);
pub const SVC_TUNNEL_START: Kind = Kind::new("SVC_TUNNEL_START", exit::SERVICE_ERROR);
pub const SVC_TUNNEL_STOP: Kind = Kind::new("SVC_TUNNEL_STOP", exit::SERVICE_ERROR);
pub const SVC_NOT_FOUND: Kind = Kind::new("SVC_NOT_FOUND", exit::SERVICE_NOT_FOUND);

pub const ENV_DRIVER_CONFLICT: Kind = Kind::new("ENV_DRIVER_CONFLICT", exit::DRIVER_CONFLICT);
pub const ENV_MULTINODE_CONFLICT: Kind =
    Kind::new("ENV_MULTINODE_CONFLICT", exit::GUEST_CONFLICT);
pub const ENV_DOCKER_UNAVAILABLE: Kind =
    Kind::new("ENV_DOCKER_UNAVAILABLE", exit::RUNTIME_UNAVAILABLE);
pub const ENV_PODMAN_UNAVAILABLE: Kind =
    Kind::new("ENV_PODMAN_UNAVAILABLE", exit::RUNTIME_UNAVAILABLE);

pub const ADDON_UNSUPPORTED: Kind = Kind::new("SVC_ADDON_UNSUPPORTED", exit::SERVICE_UNSUPPORTED);
pub const ADDON_NOT_ENABLED: Kind = Kind::new("SVC_ADDON_NOT_ENABLED", exit::PROGRAM_CONFLICT);

pub const K8S_INSTALL_FAILED: Kind = Kind::new("K8S_INSTALL_FAILED", exit::CONTROL_PLANE_ERROR);
pub const K8S_OLD_UNSUPPORTED: Kind =
    Kind::new("K8S_OLD_UNSUPPORTED", exit::CONTROL_PLANE_UNSUPPORTED);
pub const K8S_DOWNGRADE_UNSUPPORTED: Kind =
    Kind::new("K8S_DOWNGRADE_UNSUPPORTED", exit::CONTROL_PLANE_UNSUPPORTED)
        .style(Style::SeeNoEvil)
        .advice(
            "1) Recreate the cluster with Kubernetes {{.new}}, by running:\n\n\
             \t  minikube delete{{.profile}}\n\
             \t  minikube start{{.profile}} --kubernetes-version={{.new}}\n\n\
             2) Create a second cluster with Kubernetes {{.new}}, by running:\n\n\
             \t  minikube start -p {{.suggested_name}} --kubernetes-version={{.new}}\n\n\
             3) Use the existing cluster at version Kubernetes {{.old}}, by running:\n\n\
             \t  minikube start{{.profile}} --kubernetes-version={{.old}}",
        );

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_follow_category_layout() {
        assert_eq!(USAGE.exit_code, 14);
        assert_eq!(INTERRUPTED.exit_code, 2);
        assert_eq!(GUEST_PROVISION.exit_code, 80);
        assert_eq!(GUEST_START.exit_code, 80);
        assert_eq!(K8S_DOWNGRADE_UNSUPPORTED.exit_code, 106);
        assert_eq!(DRV_UNSUPPORTED_OS.exit_code, 56);
        assert_eq!(ENV_DRIVER_CONFLICT.exit_code, 51);
        assert_eq!(ENV_MULTINODE_CONFLICT.exit_code, 81);
    }

    #[test]
    fn issue_urls() {
        let kind = Kind::new("X", 1).issues(&[5532, 1]);
        assert_eq!(
            kind.issue_urls(),
            vec![
                "https://github.com/kubernetes/minikube/issues/5532".to_string(),
                "https://github.com/kubernetes/minikube/issues/1".to_string()
            ]
        );
    }

    #[test]
    fn advice_placeholders_are_substituted() {
        let advice = DRV_CP_ENDPOINT.render_advice(&[("profile_arg", "-p foo")]);
        assert!(advice.contains("minikube delete -p foo"));
        assert!(!advice.contains("{{"));
    }

    #[test]
    fn messages_leave_out_kind_tags() {
        let err = with_kind(GUEST_NOT_FOUND, anyhow::anyhow!("Profile \"dev\" not found"));
        let err = err.context("loading profile");
        assert_eq!(message(&err), "loading profile: Profile \"dev\" not found");
        assert_eq!(kind_of(&err).map(|k| k.id), Some("GUEST_NOT_FOUND"));
    }

    #[test]
    fn classify_keeps_no_match_kinds() {
        let err = usage("sudo systemctl start docker: exit status 5");
        assert_eq!(classify(&err, "linux").id, "MK_USAGE");
    }

    #[test]
    fn classify_matches_known_issue_under_context() {
        let err = anyhow::anyhow!("sudo systemctl start docker: exit status 5")
            .context("Failed to enable container runtime");
        let kind = classify(&err, "linux");
        assert_eq!(kind.id, "RT_DOCKER_EXIT_5");
        assert!((90..100).contains(&kind.exit_code));
    }

    #[test]
    fn classify_refines_requested_kind() {
        let err = with_kind(GUEST_START, anyhow::anyhow!("machine does not exist"));
        assert_eq!(classify(&err, "linux").id, "GUEST_DOES_NOT_EXIST");
        let err = with_kind(GUEST_START, anyhow::anyhow!("something odd"));
        assert_eq!(classify(&err, "linux").id, "GUEST_START");
    }

    #[test]
    fn unclassified_errors_exit_with_program_error() {
        let err = anyhow::anyhow!("this is just a lame error message with no matches.");
        let kind = classify(&err, "linux");
        assert_eq!(kind.exit_code, 10);
    }
}
