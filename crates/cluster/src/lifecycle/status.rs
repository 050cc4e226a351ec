//! `minikube status`.
use std::collections::BTreeMap;

use lazy_static::lazy_static;
use machine_rpc::MachineState;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::debug;

use crate::bootstrapper::verify;
use crate::config::{machine_name, ClusterConfig, Node, Settings};
use crate::cruntime::ContainerState;
use crate::kubeconfig;
use crate::localpath::MiniHome;
use crate::reason;

use super::{api_endpoint, load_config, NodeHandle};

pub const RUNNING: &str = "Running";
pub const STOPPED: &str = "Stopped";
pub const PAUSED: &str = "Paused";
pub const NONEXISTENT: &str = "Nonexistent";
pub const IRRELEVANT: &str = "Irrelevant";
pub const CONFIGURED: &str = "Configured";
pub const MISCONFIGURED: &str = "Misconfigured";

/// Exit code bits of `status`.
pub const HOST_NOT_RUNNING: i32 = 1 << 0;
pub const KUBELET_NOT_RUNNING: i32 = 1 << 1;
pub const APISERVER_NOT_RUNNING: i32 = 1 << 2;

pub const CONTROL_PLANE_FORMAT: &str = "{{.Name}}\ntype: Control Plane\nhost: {{.Host}}\nkubelet: {{.Kubelet}}\napiserver: {{.APIServer}}\nkubeconfig: {{.Kubeconfig}}\n";
pub const WORKER_FORMAT: &str = "{{.Name}}\ntype: Worker\nhost: {{.Host}}\nkubelet: {{.Kubelet}}\n";

lazy_static! {
    static ref FIELD: Regex = Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").expect("static regex");
}

/// The state of one node as reported by `status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    pub name: String,
    pub host: String,
    pub kubelet: String,
    #[serde(rename = "APIServer")]
    pub apiserver: String,
    pub kubeconfig: String,
    pub worker: bool,
}

impl NodeStatus {
    fn all(name: String, worker: bool, state: &str) -> Self {
        NodeStatus {
            name,
            host: state.to_string(),
            kubelet: state.to_string(),
            apiserver: if worker { IRRELEVANT } else { state }.to_string(),
            kubeconfig: if worker { IRRELEVANT } else { state }.to_string(),
            worker,
        }
    }

    /// The exit code bits this node contributes.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if self.host != RUNNING {
            code |= HOST_NOT_RUNNING;
        }
        if self.kubelet != RUNNING {
            code |= KUBELET_NOT_RUNNING;
        }
        if !self.worker && self.apiserver != RUNNING {
            code |= APISERVER_NOT_RUNNING;
        }
        code
    }

    fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut m = BTreeMap::new();
        m.insert("Name", self.name.clone());
        m.insert("Host", self.host.clone());
        m.insert("Kubelet", self.kubelet.clone());
        m.insert("APIServer", self.apiserver.clone());
        m.insert("Kubeconfig", self.kubeconfig.clone());
        m.insert("Worker", self.worker.to_string());
        m
    }

    /// Renders a `{{.Field}}` template.
    pub fn render(&self, template: &str) -> anyhow::Result<String> {
        let fields = self.fields();
        let mut unknown = None;
        let rendered = FIELD.replace_all(template, |c: &Captures| match fields.get(&c[1]) {
            Some(v) => v.clone(),
            None => {
                unknown.get_or_insert_with(|| c[1].to_string());
                String::new()
            }
        });
        if let Some(field) = unknown {
            return Err(reason::usage(format!(
                "unknown field {:?} in --format, valid fields are: {}",
                field,
                fields.keys().copied().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(rendered.replace("\\n", "\n"))
    }
}

/// How `status` prints its result.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    Text,
    Json,
    Template(String),
}

impl Output {
    /// Resolves `--output` and `--format`, which are mutually exclusive.
    pub fn from_flags(output: Option<&str>, format: Option<&str>) -> anyhow::Result<Self> {
        match (output, format) {
            (Some(_), Some(_)) => Err(reason::usage("the --format and --output flags cannot be combined")),
            (None, Some(f)) => Ok(Output::Template(f.to_string())),
            (Some("json"), None) => Ok(Output::Json),
            (Some("text"), None) | (None, None) => Ok(Output::Text),
            (Some(o), None) => Err(reason::usage(format!("invalid output format {:?}, valid values are: text, json", o))),
        }
    }
}

/// Prints the statuses in the chosen output.
pub fn render(statuses: &[NodeStatus], output: &Output) -> anyhow::Result<String> {
    match output {
        Output::Json => {
            let v = if statuses.len() == 1 {
                serde_json::to_string(&statuses[0])
            } else {
                serde_json::to_string(statuses)
            };
            v.map_err(|e| reason::with_kind(reason::INTERNAL_STATUS_JSON, e))
        }
        Output::Text => {
            let mut s = String::new();
            for st in statuses {
                s.push_str(&st.render(if st.worker { WORKER_FORMAT } else { CONTROL_PLANE_FORMAT })?);
                s.push('\n');
            }
            Ok(s)
        }
        Output::Template(t) => {
            let mut s = String::new();
            for st in statuses {
                s.push_str(&st.render(t)?);
            }
            Ok(s)
        }
    }
}

/// The combined exit code of every node.
pub fn exit_code(statuses: &[NodeStatus]) -> i32 {
    statuses.iter().fold(0, |code, s| code | s.exit_code())
}

/// The status of one node.
pub async fn node_status(home: &MiniHome, cc: &ClusterConfig, node: &Node, kubeconfig_path: &std::path::Path) -> anyhow::Result<NodeStatus> {
    let name = machine_name(cc, node);
    let worker = !node.control_plane;
    let handle = match NodeHandle::load(home, cc, node).await {
        Ok(h) => h,
        Err(e) => {
            debug!(machine = %name, error = %e, "machine does not load");
            return Ok(NodeStatus::all(name, worker, NONEXISTENT));
        }
    };
    let state = handle.state().await?;
    if state != MachineState::Running {
        let shown = match state {
            MachineState::None => NONEXISTENT.to_string(),
            MachineState::Paused => PAUSED.to_string(),
            _ => STOPPED.to_string(),
        };
        return Ok(NodeStatus::all(name, worker, &shown));
    }

    let mut st = NodeStatus {
        name,
        host: RUNNING.to_string(),
        kubelet: verify::kubelet_status(handle.runner.as_ref()).await.to_string(),
        apiserver: IRRELEVANT.to_string(),
        kubeconfig: IRRELEVANT.to_string(),
        worker,
    };
    if worker {
        return Ok(st);
    }

    let (host, port) = api_endpoint(cc, node, &handle.driver).await?;
    st.kubeconfig = match kubeconfig::endpoint(kubeconfig_path, &cc.name).await {
        Ok((h, p)) if h == host && p == port => CONFIGURED.to_string(),
        Ok(_) | Err(_) => MISCONFIGURED.to_string(),
    };
    let server = kubeconfig::server_url(&host, port);
    st.apiserver = verify::apiserver_status(handle.runner.as_ref(), &server, &home.ca_cert())
        .await
        .to_string();
    if st.apiserver != RUNNING && st.kubelet != RUNNING {
        let runtime = handle.runtime(cc)?;
        let paused = runtime
            .list_containers(ContainerState::Paused, &["kube-system".to_string()])
            .await
            .unwrap_or_default();
        if !paused.is_empty() {
            st.apiserver = PAUSED.to_string();
        }
    }
    Ok(st)
}

/// The status of every node of the profile in `settings`, or of one node.
pub async fn status(settings: &Settings, node_name: Option<&str>) -> anyhow::Result<Vec<NodeStatus>> {
    let cc = load_config(&settings.store(), &settings.profile).await?;
    let nodes: Vec<Node> = match node_name {
        Some(n) => vec![super::find_node(&cc, n)?],
        None => cc.nodes.clone(),
    };
    let mut statuses = Vec::with_capacity(nodes.len());
    for node in &nodes {
        statuses.push(
            node_status(&settings.home, &cc, node, &settings.kubeconfig)
                .await
                .map_err(|e| match reason::kind_of(&e) {
                    Some(_) => e,
                    None => reason::with_kind(reason::GUEST_STATUS, e),
                })?,
        );
    }
    Ok(statuses)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifecycle::test::cluster;

    fn running() -> NodeStatus {
        NodeStatus {
            name: "minikube".to_string(),
            host: RUNNING.to_string(),
            kubelet: RUNNING.to_string(),
            apiserver: RUNNING.to_string(),
            kubeconfig: CONFIGURED.to_string(),
            worker: false,
        }
    }

    #[test]
    fn exit_codes_combine_per_component() {
        assert_eq!(exit_code(&[running()]), 0);
        let mut st = running();
        st.kubelet = STOPPED.to_string();
        st.apiserver = STOPPED.to_string();
        assert_eq!(st.exit_code(), KUBELET_NOT_RUNNING | APISERVER_NOT_RUNNING);
        let stopped = NodeStatus::all("m02".to_string(), true, STOPPED);
        assert_eq!(stopped.exit_code(), HOST_NOT_RUNNING | KUBELET_NOT_RUNNING);
        assert_eq!(exit_code(&[running(), stopped]), 3);
    }

    #[test]
    fn templates_render_fields() {
        let st = running();
        assert_eq!(st.render("{{.Host}}/{{ .APIServer }}").expect("render"), "Running/Running");
        let err = st.render("{{.Bogus}}").expect_err("unknown");
        assert_eq!(reason::kind_of(&err).map(|k| k.id), Some("MK_USAGE"));
        let text = render(&[st], &Output::Text).expect("text");
        assert!(text.starts_with("minikube\ntype: Control Plane\nhost: Running\n"));
    }

    #[test]
    fn json_is_an_object_for_one_node() {
        let json = render(&[running()], &Output::Json).expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(v["APIServer"], "Running");
        assert_eq!(v["Worker"], false);
        let json = render(&[running(), running()], &Output::Json).expect("json");
        assert!(json.starts_with('['));
    }

    #[test]
    fn format_and_output_are_exclusive() {
        assert!(Output::from_flags(Some("json"), Some("{{.Host}}")).is_err());
        assert_eq!(Output::from_flags(None, None).expect("text"), Output::Text);
        assert_eq!(
            Output::from_flags(None, Some("{{.Host}}")).expect("template"),
            Output::Template("{{.Host}}".to_string())
        );
        assert!(Output::from_flags(Some("yaml"), None).is_err());
    }

    #[tokio::test]
    async fn missing_machines_are_nonexistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        let cc = cluster("p1", "kvm2", 1);
        let cp = node_status(&home, &cc, &cc.nodes[0], &dir.path().join("kubeconfig"))
            .await
            .expect("status");
        assert_eq!(cp.host, NONEXISTENT);
        assert_eq!(cp.apiserver, NONEXISTENT);
        let worker = node_status(&home, &cc, &cc.nodes[1], &dir.path().join("kubeconfig"))
            .await
            .expect("status");
        assert_eq!(worker.name, "p1-m02");
        assert_eq!(worker.kubeconfig, IRRELEVANT);
        assert_eq!(exit_code(&[cp, worker]), 7);
    }
}
