//! `docker-env` and `podman-env`: shell scripts that point a local client
//! at the daemon inside the cluster.
//!
//! Every shell difference lives in the [`Syntax`] table; the rest of the
//! module deals in `(name, value)` pairs.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::command::bracket_ipv6;
use crate::config::ClusterConfig;
use crate::constants::{self, DEFAULT_CLUSTER_NAME};
use crate::cruntime::{self, EnvCommand};
use crate::reason;

/// A shell to emit a script for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Cmd,
    Emacs,
    Tcsh,
    /// Plain `NAME=value` lines.
    None,
}

impl FromStr for Shell {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "bash" | "sh" => Shell::Bash,
            "zsh" => Shell::Zsh,
            "fish" => Shell::Fish,
            "powershell" | "pwsh" => Shell::PowerShell,
            "cmd" => Shell::Cmd,
            "emacs" => Shell::Emacs,
            "tcsh" | "csh" => Shell::Tcsh,
            "none" => Shell::None,
            other => {
                return Err(reason::with_kind(
                    reason::INTERNAL_SHELL_DETECT,
                    anyhow::anyhow!("unknown shell {:?}, valid values are bash, zsh, fish, powershell, cmd, emacs, tcsh, none", other),
                ))
            }
        })
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::PowerShell => "powershell",
            Shell::Cmd => "cmd",
            Shell::Emacs => "emacs",
            Shell::Tcsh => "tcsh",
            Shell::None => "none",
        })
    }
}

/// The shell to emit for: `forced` when given, otherwise guessed from the
/// environment.
pub fn detect_shell(forced: &str, vars: &BTreeMap<String, String>) -> anyhow::Result<Shell> {
    if !forced.is_empty() {
        return forced.parse();
    }
    if cfg!(windows) {
        return Ok(if vars.contains_key("PSModulePath") {
            Shell::PowerShell
        } else {
            Shell::Cmd
        });
    }
    let shell = vars.get("SHELL").map(String::as_str).unwrap_or_default();
    let base = shell.rsplit('/').next().unwrap_or_default();
    Ok(base.parse().unwrap_or(Shell::Bash))
}

struct Syntax {
    set_prefix: &'static str,
    set_delim: &'static str,
    set_suffix: &'static str,
    unset_prefix: &'static str,
    unset_delim: &'static str,
    unset_suffix: &'static str,
    /// Comment leader for the usage hint, `None` for no hint.
    comment: Option<&'static str>,
    /// Whether the hint is separated by a blank line.
    blank_before_hint: bool,
}

fn syntax(shell: Shell) -> Syntax {
    let s = |set_prefix, set_delim, set_suffix, unset_prefix, unset_delim, unset_suffix, comment, blank_before_hint| Syntax {
        set_prefix,
        set_delim,
        set_suffix,
        unset_prefix,
        unset_delim,
        unset_suffix,
        comment,
        blank_before_hint,
    };
    match shell {
        Shell::Bash | Shell::Zsh => s("export ", "=\"", "\"\n", "unset ", "", ";\n", Some("#"), true),
        Shell::Fish => s("set -gx ", " \"", "\";\n", "set -e ", "", ";\n", Some("#"), true),
        Shell::PowerShell => s("$Env:", " = \"", "\"\n", r"Remove-Item Env:\\", "", "\n", Some("#"), false),
        Shell::Cmd => s("SET ", "=", "\n", "SET ", "=", "\n", Some("REM"), false),
        Shell::Emacs => s("(setenv \"", "\" \"", "\")\n", "(setenv \"", "\" nil", ")\n", Some(";;"), false),
        Shell::Tcsh => s("setenv ", " \"", "\";\n", "unsetenv ", "", ";\n", Some(":"), true),
        Shell::None => s("", "=", "\n", "", "", "\n", None, false),
    }
}

/// Which client the script configures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Docker,
    Podman,
}

impl Target {
    fn subcommand(self) -> &'static str {
        match self {
            Target::Docker => "docker-env",
            Target::Podman => "podman-env",
        }
    }

    fn daemon(self) -> &'static str {
        match self {
            Target::Docker => "docker-daemon",
            Target::Podman => "podman service",
        }
    }
}

/// The command line a user runs to evaluate the script in `shell`.
fn usage_hint(shell: Shell, target: Target, profile: &str, extra: &str) -> String {
    let syn = syntax(shell);
    let comment = match syn.comment {
        Some(c) => c,
        None => return String::new(),
    };
    let mut cmd = "minikube".to_string();
    if profile != DEFAULT_CLUSTER_NAME {
        cmd.push_str(" -p ");
        cmd.push_str(profile);
    }
    cmd.push(' ');
    cmd.push_str(target.subcommand());
    cmd.push_str(extra);
    let run = match shell {
        Shell::Fish => format!("{} | source", cmd),
        Shell::PowerShell => format!("& {} --shell powershell | Invoke-Expression", cmd),
        Shell::Cmd => format!("@FOR /f \"tokens=*\" %i IN ('{} --shell cmd') DO @%i", cmd),
        Shell::Emacs => format!(
            "(with-temp-buffer (shell-command \"{}\" (current-buffer)) (eval-buffer))",
            cmd
        ),
        Shell::Tcsh => format!("eval `{}`", cmd),
        _ => format!("eval $({})", cmd),
    };
    format!(
        "{blank}{c} To point your shell to minikube's {daemon}, run:\n{c} {run}\n",
        blank = if syn.blank_before_hint { "\n" } else { "" },
        c = comment,
        daemon = target.daemon(),
        run = run,
    )
}

/// Renders `vars` as assignments, followed by `hint`.
pub fn set_script(shell: Shell, vars: &[(String, String)], hint: &str) -> String {
    let syn = syntax(shell);
    let mut s = String::new();
    for (k, v) in vars {
        s.push_str(syn.set_prefix);
        s.push_str(k);
        s.push_str(syn.set_delim);
        s.push_str(v);
        s.push_str(syn.set_suffix);
    }
    s.push_str(hint);
    s
}

/// Renders the removal of `names`.
pub fn unset_script(shell: Shell, names: &[String]) -> String {
    let syn = syntax(shell);
    let mut s = String::new();
    for k in names {
        s.push_str(syn.unset_prefix);
        s.push_str(k);
        s.push_str(syn.unset_delim);
        s.push_str(syn.unset_suffix);
    }
    s
}

/// `--output` of the `none` shell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
    Yaml,
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "yaml" => Ok(Format::Yaml),
            other => Err(reason::usage(format!(
                "invalid output format {:?}: valid values are text, json and yaml",
                other
            ))),
        }
    }
}

/// Renders variables as a machine readable map, or names as a list.
pub fn structured(format: Format, vars: &[(String, String)]) -> anyhow::Result<String> {
    let map: serde_json::Map<String, serde_json::Value> = vars
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    Ok(match format {
        Format::Json => serde_json::to_string(&map)?,
        Format::Yaml => serde_yaml::to_string(&map)?,
        Format::Text => set_script(Shell::None, vars, ""),
    })
}

pub fn structured_names(format: Format, names: &[String]) -> anyhow::Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string(names)?,
        Format::Yaml => serde_yaml::to_string(names)?,
        Format::Text => unset_script(Shell::None, names),
    })
}

/// Where the guest's daemon is reachable over ssh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: String,
}

/// A running ssh-agent, as reported by `ssh-agent -s`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshAgent {
    pub auth_sock: String,
    pub pid: u32,
}

/// Inputs of `docker-env`.
#[derive(Clone, Debug, Default)]
pub struct DockerEnv {
    pub profile: String,
    pub driver: String,
    pub host_ip: String,
    pub port: u16,
    pub certs_dir: String,
    /// Emit an `ssh://` host instead of TLS over TCP.
    pub ssh: Option<SshEndpoint>,
    pub agent: Option<SshAgent>,
    pub no_proxy: bool,
    /// The caller's environment.
    pub environ: BTreeMap<String, String>,
}

impl Default for SshEndpoint {
    fn default() -> Self {
        SshEndpoint {
            user: "docker".to_string(),
            host: String::new(),
            port: constants::SSH_PORT,
            key_path: String::new(),
        }
    }
}

/// Checks that `docker-env` makes sense for the cluster.
pub fn check_docker_env(cc: &ClusterConfig) -> anyhow::Result<()> {
    cruntime::check_env_compatible(EnvCommand::DockerEnv, &cc.driver, cc.container_runtime(), cc.nodes.len())
}

/// Checks that `podman-env` makes sense for the cluster.
pub fn check_podman_env(cc: &ClusterConfig) -> anyhow::Result<()> {
    cruntime::check_env_compatible(EnvCommand::PodmanEnv, &cc.driver, cc.container_runtime(), cc.nodes.len())
}

/// Adds `ip` to the caller's no-proxy list unless it is already there.
///
/// Returns the variable name in use (`NO_PROXY` or `no_proxy`) and its new
/// value.
pub fn no_proxy_value(environ: &BTreeMap<String, String>, ip: &str) -> (String, String) {
    let (name, current) = ["NO_PROXY", "no_proxy"]
        .iter()
        .find_map(|k| environ.get(*k).map(|v| (k.to_string(), v.clone())))
        .unwrap_or_else(|| ("NO_PROXY".to_string(), String::new()));
    let value = if current.is_empty() {
        ip.to_string()
    } else if current.split(',').any(|p| p.trim() == ip) {
        current
    } else {
        format!("{},{}", current, ip)
    };
    (name, value)
}

/// The variables set by `docker-env`, in output order.
pub fn docker_env_vars(e: &DockerEnv) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    let active_already = e.environ.contains_key(constants::MINIKUBE_ACTIVE_DOCKERD_ENV);
    match &e.ssh {
        Some(ssh) => vars.push((
            constants::DOCKER_HOST_ENV.to_string(),
            format!("ssh://{}@{}:{}", ssh.user, bracket_ipv6(&ssh.host), ssh.port),
        )),
        None => {
            vars.push((constants::DOCKER_TLS_VERIFY_ENV.to_string(), "1".to_string()));
            vars.push((
                constants::DOCKER_HOST_ENV.to_string(),
                format!("tcp://{}:{}", bracket_ipv6(&e.host_ip), e.port),
            ));
            vars.push((constants::DOCKER_CERT_PATH_ENV.to_string(), e.certs_dir.clone()));
        }
    }
    vars.push((constants::MINIKUBE_ACTIVE_DOCKERD_ENV.to_string(), e.profile.clone()));
    if let Some(agent) = &e.agent {
        vars.push((constants::SSH_AUTH_SOCK_ENV.to_string(), agent.auth_sock.clone()));
        vars.push((constants::SSH_AGENT_PID_ENV.to_string(), agent.pid.to_string()));
    }
    if e.no_proxy {
        vars.push(no_proxy_value(&e.environ, &e.host_ip));
    }
    if !active_already {
        for name in constants::DOCKER_DAEMON_ENVS.iter() {
            if let Some(v) = e.environ.get(*name).filter(|v| !v.is_empty()) {
                vars.push((format!("{}{}", constants::MINIKUBE_EXISTING_PREFIX, name), v.clone()));
            }
        }
    }
    vars
}

/// The full `docker-env` script.
pub fn docker_set_script(shell: Shell, e: &DockerEnv) -> String {
    let extra = if e.ssh.is_some() { " --ssh-host" } else { "" };
    set_script(
        shell,
        &docker_env_vars(e),
        &usage_hint(shell, Target::Docker, &e.profile, extra),
    )
}

/// The names removed by `docker-env --unset`, and the values restored from
/// `MINIKUBE_EXISTING_*`.
pub fn docker_unset_vars(e: &DockerEnv) -> (Vec<String>, Vec<(String, String)>) {
    let mut names: Vec<String> = vec![
        constants::DOCKER_TLS_VERIFY_ENV,
        constants::DOCKER_HOST_ENV,
        constants::DOCKER_CERT_PATH_ENV,
        constants::MINIKUBE_ACTIVE_DOCKERD_ENV,
        constants::SSH_AUTH_SOCK_ENV,
        constants::SSH_AGENT_PID_ENV,
    ]
    .into_iter()
    .map(String::from)
    .collect();
    if e.no_proxy {
        names.push(no_proxy_value(&e.environ, &e.host_ip).0);
    }
    let mut restore = Vec::new();
    for name in constants::DOCKER_DAEMON_ENVS.iter() {
        let saved = format!("{}{}", constants::MINIKUBE_EXISTING_PREFIX, name);
        if let Some(v) = e.environ.get(&saved) {
            restore.push((name.to_string(), v.clone()));
            names.push(saved);
        }
    }
    (names, restore)
}

pub fn docker_unset_script(shell: Shell, e: &DockerEnv) -> String {
    let (names, restore) = docker_unset_vars(e);
    let mut s = unset_script(shell, &names);
    s.push_str(&set_script(shell, &restore, ""));
    s
}

/// Inputs of `podman-env`.
#[derive(Clone, Debug)]
pub struct PodmanEnv {
    pub profile: String,
    pub ssh: SshEndpoint,
}

pub fn podman_env_vars(e: &PodmanEnv) -> Vec<(String, String)> {
    vec![
        (
            constants::PODMAN_CONTAINER_HOST_ENV.to_string(),
            format!(
                "ssh://{}@{}:{}/run/podman/podman.sock",
                e.ssh.user,
                bracket_ipv6(&e.ssh.host),
                e.ssh.port
            ),
        ),
        (
            constants::PODMAN_CONTAINER_SSH_KEY_ENV.to_string(),
            e.ssh.key_path.clone(),
        ),
        (constants::MINIKUBE_ACTIVE_PODMAN_ENV.to_string(), e.profile.clone()),
    ]
}

pub fn podman_set_script(shell: Shell, e: &PodmanEnv) -> String {
    set_script(
        shell,
        &podman_env_vars(e),
        &usage_hint(shell, Target::Podman, &e.profile, ""),
    )
}

pub fn podman_unset_names() -> Vec<String> {
    vec![
        constants::PODMAN_VARLINK_BRIDGE_ENV.to_string(),
        constants::PODMAN_CONTAINER_HOST_ENV.to_string(),
        constants::PODMAN_CONTAINER_SSH_KEY_ENV.to_string(),
        constants::MINIKUBE_ACTIVE_PODMAN_ENV.to_string(),
    ]
}

/// Parses the `SSH_AUTH_SOCK=...; export ...` output of `ssh-agent -s`.
pub fn parse_ssh_agent(output: &str) -> Option<SshAgent> {
    let mut sock = None;
    let mut pid = None;
    for stmt in output.split(|c| c == ';' || c == '\n') {
        let stmt = stmt.trim();
        if let Some(v) = stmt.strip_prefix("SSH_AUTH_SOCK=") {
            sock = Some(v.to_string());
        } else if let Some(v) = stmt.strip_prefix("SSH_AGENT_PID=") {
            pid = v.parse().ok();
        }
    }
    Some(SshAgent {
        auth_sock: sock?,
        pid: pid?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn tcp(profile: &str, driver: &str, ip: &str, port: u16) -> DockerEnv {
        DockerEnv {
            profile: profile.to_string(),
            driver: driver.to_string(),
            host_ip: ip.to_string(),
            port,
            certs_dir: "/certs".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn bash_script() {
        let e = tcp("bash", "kvm2", "127.0.0.1", 2376);
        assert_eq!(
            docker_set_script(Shell::Bash, &e),
            "export DOCKER_TLS_VERIFY=\"1\"\n\
             export DOCKER_HOST=\"tcp://127.0.0.1:2376\"\n\
             export DOCKER_CERT_PATH=\"/certs\"\n\
             export MINIKUBE_ACTIVE_DOCKERD=\"bash\"\n\
             \n\
             # To point your shell to minikube's docker-daemon, run:\n\
             # eval $(minikube -p bash docker-env)\n"
        );
        assert_eq!(
            docker_unset_script(Shell::Bash, &e),
            "unset DOCKER_TLS_VERIFY;\nunset DOCKER_HOST;\nunset DOCKER_CERT_PATH;\n\
             unset MINIKUBE_ACTIVE_DOCKERD;\nunset SSH_AUTH_SOCK;\nunset SSH_AGENT_PID;\n"
        );
    }

    #[test]
    fn ssh_host_and_ipv6() {
        let mut e = tcp("dockerdriver", "docker", "", 0);
        e.ssh = Some(SshEndpoint {
            user: "root".to_string(),
            host: "host".to_string(),
            port: 22,
            key_path: String::new(),
        });
        assert_eq!(
            docker_set_script(Shell::Bash, &e),
            "export DOCKER_HOST=\"ssh://root@host:22\"\n\
             export MINIKUBE_ACTIVE_DOCKERD=\"dockerdriver\"\n\
             \n\
             # To point your shell to minikube's docker-daemon, run:\n\
             # eval $(minikube -p dockerdriver docker-env --ssh-host)\n"
        );
        let e = tcp("ipv6", "kvm2", "fe80::215:5dff:fe00:a903", 2376);
        assert!(docker_set_script(Shell::Bash, &e)
            .contains("export DOCKER_HOST=\"tcp://[fe80::215:5dff:fe00:a903]:2376\"\n"));
    }

    #[test]
    fn powershell_no_proxy_is_idempotent() {
        let mut e = tcp("powershell-no-proxy-idempotent", "hyperv", "192.168.0.1", 2376);
        e.no_proxy = true;
        e.environ.insert("no_proxy".to_string(), "192.168.0.1".to_string());
        assert_eq!(
            docker_set_script(Shell::PowerShell, &e),
            "$Env:DOCKER_TLS_VERIFY = \"1\"\n\
             $Env:DOCKER_HOST = \"tcp://192.168.0.1:2376\"\n\
             $Env:DOCKER_CERT_PATH = \"/certs\"\n\
             $Env:MINIKUBE_ACTIVE_DOCKERD = \"powershell-no-proxy-idempotent\"\n\
             $Env:no_proxy = \"192.168.0.1\"\n\
             # To point your shell to minikube's docker-daemon, run:\n\
             # & minikube -p powershell-no-proxy-idempotent docker-env --shell powershell | Invoke-Expression\n"
        );
        assert!(docker_unset_script(Shell::PowerShell, &e).ends_with("Remove-Item Env:\\\\no_proxy\n"));
    }

    #[test]
    fn no_proxy_appends() {
        let mut env = BTreeMap::new();
        env.insert("NO_PROXY".to_string(), "192.168.0.1,10.0.0.4".to_string());
        assert_eq!(
            no_proxy_value(&env, "127.0.0.1"),
            ("NO_PROXY".to_string(), "192.168.0.1,10.0.0.4,127.0.0.1".to_string())
        );
        assert_eq!(
            no_proxy_value(&BTreeMap::new(), "127.0.0.1"),
            ("NO_PROXY".to_string(), "127.0.0.1".to_string())
        );
    }

    #[test]
    fn other_shells() {
        let e = tcp("fish", "kvm2", "127.0.0.1", 2376);
        let fish = docker_set_script(Shell::Fish, &e);
        assert!(fish.starts_with("set -gx DOCKER_TLS_VERIFY \"1\";\n"));
        assert!(fish.ends_with("# minikube -p fish docker-env | source\n"));
        let e = tcp("cmd", "hyperv", "192.168.0.1", 2376);
        assert!(docker_set_script(Shell::Cmd, &e).contains(
            "SET MINIKUBE_ACTIVE_DOCKERD=cmd\nREM To point your shell to minikube's docker-daemon, run:\n"
        ));
        assert!(docker_unset_script(Shell::Cmd, &e).starts_with("SET DOCKER_TLS_VERIFY=\n"));
        let e = tcp("emacs", "hyperv", "192.168.0.1", 2376);
        assert!(docker_unset_script(Shell::Emacs, &e).starts_with("(setenv \"DOCKER_TLS_VERIFY\" nil)\n"));
        let e = tcp("noneshell", "docker", "127.0.0.1", 32842);
        assert_eq!(
            docker_set_script(Shell::None, &e),
            "DOCKER_TLS_VERIFY=1\nDOCKER_HOST=tcp://127.0.0.1:32842\nDOCKER_CERT_PATH=/certs\nMINIKUBE_ACTIVE_DOCKERD=noneshell\n"
        );
        let e = tcp(DEFAULT_CLUSTER_NAME, "kvm2", "127.0.0.1", 2376);
        assert!(docker_set_script(Shell::Tcsh, &e).ends_with(": eval `minikube docker-env`\n"));
    }

    #[test]
    fn existing_daemon_is_preserved_and_restored() {
        let mut e = tcp("p1", "kvm2", "10.0.0.2", 2376);
        e.environ.insert("DOCKER_HOST".to_string(), "unix:///var/run/other.sock".to_string());
        let vars = docker_env_vars(&e);
        assert!(vars.contains(&(
            "MINIKUBE_EXISTING_DOCKER_HOST".to_string(),
            "unix:///var/run/other.sock".to_string()
        )));
        e.environ.insert("MINIKUBE_ACTIVE_DOCKERD".to_string(), "p1".to_string());
        assert!(!docker_env_vars(&e)
            .iter()
            .any(|(k, _)| k.starts_with("MINIKUBE_EXISTING_")));

        e.environ.insert(
            "MINIKUBE_EXISTING_DOCKER_HOST".to_string(),
            "unix:///var/run/other.sock".to_string(),
        );
        let unset = docker_unset_script(Shell::Bash, &e);
        assert!(unset.contains("unset MINIKUBE_EXISTING_DOCKER_HOST;\n"));
        assert!(unset.ends_with("export DOCKER_HOST=\"unix:///var/run/other.sock\"\n"));
    }

    #[test]
    fn structured_output() {
        let e = tcp("nonejson", "docker", "127.0.0.1", 32842);
        let json = structured(Format::Json, &docker_env_vars(&e)).expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(v["DOCKER_HOST"], "tcp://127.0.0.1:32842");
        let (names, _) = docker_unset_vars(&e);
        let yaml = structured_names(Format::Yaml, &names).expect("yaml");
        assert!(yaml.contains("- DOCKER_TLS_VERIFY"));
    }

    #[test]
    fn preconditions() {
        let mut cc = ClusterConfig::new("p1");
        cc.driver = "none".to_string();
        let err = check_docker_env(&cc).expect_err("none driver");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("ENV_DRIVER_CONFLICT"));

        cc.driver = "kvm2".to_string();
        cc.nodes = vec![Default::default(), Default::default()];
        let err = check_podman_env(&cc).expect_err("multinode");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("ENV_MULTINODE_CONFLICT"));

        cc.nodes.truncate(1);
        assert!(check_docker_env(&cc).is_ok());
        cc.kubernetes_config.container_runtime = "crio".to_string();
        assert!(check_docker_env(&cc).is_err());
        assert!(check_podman_env(&cc).is_ok());
    }

    #[test]
    fn podman_script() {
        let e = PodmanEnv {
            profile: "p1".to_string(),
            ssh: SshEndpoint {
                user: "docker".to_string(),
                host: "192.168.39.2".to_string(),
                port: 22,
                key_path: "/home/me/.minikube/machines/p1/id_rsa".to_string(),
            },
        };
        let s = podman_set_script(Shell::Bash, &e);
        assert!(s.starts_with(
            "export CONTAINER_HOST=\"ssh://docker@192.168.39.2:22/run/podman/podman.sock\"\n\
             export CONTAINER_SSHKEY=\"/home/me/.minikube/machines/p1/id_rsa\"\n\
             export MINIKUBE_ACTIVE_PODMAN=\"p1\"\n"
        ));
        assert!(s.ends_with("# eval $(minikube -p p1 podman-env)\n"));
    }

    #[test]
    fn shell_detection_and_agent() {
        let mut vars = BTreeMap::new();
        vars.insert("SHELL".to_string(), "/usr/bin/fish".to_string());
        if !cfg!(windows) {
            assert_eq!(detect_shell("", &vars).expect("detect"), Shell::Fish);
            vars.insert("SHELL".to_string(), "/bin/ksh".to_string());
            assert_eq!(detect_shell("", &vars).expect("detect"), Shell::Bash);
        }
        assert_eq!(detect_shell("zsh", &vars).expect("forced"), Shell::Zsh);
        assert!(detect_shell("nushell", &vars).is_err());

        let agent = parse_ssh_agent(
            "SSH_AUTH_SOCK=/tmp/ssh-X/agent.1; export SSH_AUTH_SOCK;\nSSH_AGENT_PID=2; export SSH_AGENT_PID;\necho Agent pid 2;\n",
        )
        .expect("agent");
        assert_eq!(agent.auth_sock, "/tmp/ssh-X/agent.1");
        assert_eq!(agent.pid, 2);
    }
}
