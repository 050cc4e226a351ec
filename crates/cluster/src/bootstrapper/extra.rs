//! `component.key=value` options for Kubernetes components.
//!
//! Options for the control plane components end up in the kubeadm config
//! file as `extraArgs`, options for the kubelet end up on its command line.
//! Options for kubeadm itself are split: a short list may be passed as
//! command line flags next to `--config`, the rest must go into the file.
use std::collections::BTreeMap;

use semver::Version;
use tracing::info;

use crate::config::{machine_name, ClusterConfig, ExtraOption, Node};
use crate::reason;

pub const KUBELET: &str = "kubelet";
pub const KUBEADM: &str = "kubeadm";
pub const APISERVER: &str = "apiserver";
pub const CONTROLLER_MANAGER: &str = "controller-manager";
pub const SCHEDULER: &str = "scheduler";
pub const ETCD: &str = "etcd";
pub const PROXY: &str = "proxy";

/// Every component an option may target, with its section in the kubeadm
/// config. Empty sections are not configured through kubeadm.
const COMPONENTS: &[(&str, &str)] = &[
    (APISERVER, "apiServer"),
    (CONTROLLER_MANAGER, "controllerManager"),
    (ETCD, "etcd"),
    (KUBEADM, "kubeadm"),
    (KUBELET, ""),
    (PROXY, "kubeProxy"),
    (SCHEDULER, "scheduler"),
];

/// Where a kubeadm option may be given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Accepted as a `kubeadm init` flag alongside `--config`.
    Cmd,
    /// Only accepted inside the kubeadm config file.
    Config,
}

const KUBEADM_CMD_PARAMS: &[&str] = &[
    "ignore-preflight-errors",
    "dry-run",
    "kubeconfig",
    "kubeconfig-dir",
    "node-name",
    "cri-socket",
    "experimental-upload-certs",
    "certificate-key",
    "rootfs",
    "skip-phases",
];

const KUBEADM_CONFIG_PARAMS: &[&str] = &["pod-network-cidr"];

/// Kubeadm feature gates; every other gate is passed to the components.
const KUBEADM_FEATURE_GATES: &[&str] = &[
    "PublicKeysECDSA",
    "RootlessControlPlane",
    "EtcdLearnerMode",
    "UpgradeAddonsBeforeControlPlane",
    "WaitForAllControlPlaneComponents",
    "ControlPlaneKubeletLocalMode",
    "NodeLocalCRISocket",
];

pub fn kubeadm_param_kind(key: &str) -> Option<ParamKind> {
    if KUBEADM_CMD_PARAMS.contains(&key) {
        Some(ParamKind::Cmd)
    } else if KUBEADM_CONFIG_PARAMS.contains(&key) {
        Some(ParamKind::Config)
    } else {
        None
    }
}

/// A default option applied to versions within `[min, max]`.
struct VersionedOption {
    component: &'static str,
    key: &'static str,
    value: &'static str,
    min: Option<(u64, u64)>,
    max: Option<(u64, u64)>,
}

const fn always(component: &'static str, key: &'static str, value: &'static str) -> VersionedOption {
    VersionedOption {
        component,
        key,
        value,
        min: None,
        max: None,
    }
}

const DEFAULT_OPTIONS: &[VersionedOption] = &[
    always(
        APISERVER,
        "enable-admission-plugins",
        "NamespaceLifecycle,LimitRanger,ServiceAccount,DefaultStorageClass,DefaultTolerationSeconds,NodeRestriction,MutatingAdmissionWebhook,ValidatingAdmissionWebhook,ResourceQuota",
    ),
    always(CONTROLLER_MANAGER, "allocate-node-cidrs", "true"),
    always(CONTROLLER_MANAGER, "leader-elect", "false"),
    always(SCHEDULER, "leader-elect", "false"),
    always(KUBELET, "bootstrap-kubeconfig", "/etc/kubernetes/bootstrap-kubelet.conf"),
    always(KUBELET, "config", "/var/lib/kubelet/config.yaml"),
    always(KUBELET, "kubeconfig", "/etc/kubernetes/kubelet.conf"),
    VersionedOption {
        component: KUBELET,
        key: "container-runtime",
        value: "remote",
        min: None,
        max: Some((1, 23)),
    },
    VersionedOption {
        component: KUBELET,
        key: "cgroups-per-qos",
        value: "false",
        min: None,
        max: Some((1, 20)),
    },
];

fn in_range(v: &Version, min: Option<(u64, u64)>, max: Option<(u64, u64)>) -> bool {
    let mm = (v.major, v.minor);
    min.map_or(true, |m| mm >= m) && max.map_or(true, |m| mm <= m)
}

/// Parses `component.key=value`.
pub fn parse(s: &str) -> anyhow::Result<ExtraOption> {
    let (lhs, value) = s
        .split_once('=')
        .ok_or_else(|| reason::usage(format!("invalid extra option {:?}: expected component.key=value", s)))?;
    let (component, key) = lhs
        .split_once('.')
        .ok_or_else(|| reason::usage(format!("invalid extra option {:?}: expected component.key=value", s)))?;
    if component.is_empty() || key.is_empty() {
        return Err(reason::usage(format!("invalid extra option {:?}", s)));
    }
    Ok(ExtraOption {
        component: component.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Rejects options for unknown components and unknown kubeadm keys.
pub fn validate(opts: &[ExtraOption]) -> anyhow::Result<()> {
    for opt in opts {
        if !COMPONENTS.iter().any(|(c, _)| *c == opt.component) {
            let valid: Vec<&str> = COMPONENTS.iter().map(|(c, _)| *c).collect();
            return Err(reason::usage(format!(
                "unknown component {:?} in extra option {}, valid components are: {}",
                opt.component,
                opt,
                valid.join(", ")
            )));
        }
        if opt.component == KUBEADM && kubeadm_param_kind(&opt.key).is_none() {
            return Err(reason::usage(format!(
                "{} is not a valid kubeadm parameter, valid parameters are: {}",
                opt.key,
                KUBEADM_CMD_PARAMS
                    .iter()
                    .chain(KUBEADM_CONFIG_PARAMS)
                    .copied()
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
    }
    Ok(())
}

/// The value of the last option for `component.key`, if any.
pub fn get<'a>(opts: &'a [ExtraOption], component: &str, key: &str) -> Option<&'a str> {
    opts.iter()
        .rev()
        .find(|o| o.component == component && o.key == key)
        .map(|o| o.value.as_str())
}

/// The options for one component: version defaults overridden by the
/// user's options.
pub fn for_component(component: &str, opts: &[ExtraOption], version: &Version) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = DEFAULT_OPTIONS
        .iter()
        .filter(|o| o.component == component && in_range(version, o.min, o.max))
        .map(|o| (o.key.to_string(), o.value.to_string()))
        .collect();
    for opt in opts.iter().filter(|o| o.component == component) {
        if let Some(old) = out.insert(opt.key.clone(), opt.value.clone()) {
            info!(%component, key = %opt.key, default = %old, value = %opt.value, "overriding default option");
        }
    }
    out
}

/// Splits `A=true,B=false` gates into kubeadm's gates and a string for
/// the other components.
pub fn parse_feature_gates(gates: &str) -> anyhow::Result<(BTreeMap<String, bool>, String)> {
    let mut kubeadm = BTreeMap::new();
    let mut component = Vec::new();
    for gate in gates.split(',').map(str::trim).filter(|g| !g.is_empty()) {
        let (name, value) = gate
            .split_once('=')
            .ok_or_else(|| reason::usage(format!("invalid feature gate {:?}: expected name=bool", gate)))?;
        let enabled: bool = value
            .parse()
            .map_err(|_| reason::usage(format!("invalid feature gate value {:?} for {}", value, name)))?;
        if KUBEADM_FEATURE_GATES.contains(&name) {
            kubeadm.insert(name.to_string(), enabled);
        } else {
            component.push(gate.to_string());
        }
    }
    Ok((kubeadm, component.join(",")))
}

/// Control plane options destined for the kubeadm config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentOptions {
    /// The section name in the kubeadm config, e.g. `apiServer`.
    pub section: &'static str,
    pub extra_args: BTreeMap<String, String>,
}

/// Options for every component configured through the kubeadm file.
pub fn component_options(opts: &[ExtraOption], version: &Version, component_gates: &str) -> anyhow::Result<Vec<ComponentOptions>> {
    validate(opts)?;
    let mut out = Vec::new();
    for (component, section) in COMPONENTS {
        if section.is_empty() || *component == KUBEADM {
            continue;
        }
        let mut args = for_component(component, opts, version);
        if !component_gates.is_empty() && *component != ETCD && *component != PROXY {
            args.insert("feature-gates".to_string(), component_gates.to_string());
        }
        if !args.is_empty() {
            out.push(ComponentOptions {
                section,
                extra_args: args,
            });
        }
    }
    Ok(out)
}

/// The `kubeadm init` flags from the user's kubeadm options.
pub fn kubeadm_flags(opts: &[ExtraOption]) -> String {
    let mut flags: BTreeMap<&str, &str> = BTreeMap::new();
    for o in opts.iter().filter(|o| o.component == KUBEADM) {
        if kubeadm_param_kind(&o.key) == Some(ParamKind::Cmd) {
            flags.insert(o.key.as_str(), o.value.as_str());
        }
    }
    to_flags(flags.iter().map(|(k, v)| (*k, *v)))
}

pub fn to_flags<'a, I: IntoIterator<Item = (&'a str, &'a str)>>(pairs: I) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The kubelet command line for `node`.
pub fn kubelet_flags(cc: &ClusterConfig, node: &Node, version: &Version, runtime_socket: &str) -> BTreeMap<String, String> {
    let opts = &cc.kubernetes_config.extra_options;
    let mut flags = for_component(KUBELET, &[], version);
    flags.insert("hostname-override".to_string(), machine_name(cc, node));
    if !node.ip.is_empty() {
        flags.insert("node-ip".to_string(), node.ip.clone());
    }
    if (version.major, version.minor) < (1, 27) {
        flags.insert("container-runtime-endpoint".to_string(), runtime_socket.to_string());
    }
    if !cc.kubernetes_config.feature_gates.is_empty() {
        if let Ok((_, gates)) = parse_feature_gates(&cc.kubernetes_config.feature_gates) {
            if !gates.is_empty() {
                flags.insert("feature-gates".to_string(), gates);
            }
        }
    }
    for opt in opts.iter().filter(|o| o.component == KUBELET) {
        flags.insert(opt.key.clone(), opt.value.clone());
    }
    flags
}

#[cfg(test)]
mod test {
    use super::*;

    fn opt(s: &str) -> ExtraOption {
        parse(s).expect("parse")
    }

    #[test]
    fn parses_component_key_value() {
        let o = opt("apiserver.audit-log-path=/var/log/audit=1");
        assert_eq!(o.component, "apiserver");
        assert_eq!(o.key, "audit-log-path");
        assert_eq!(o.value, "/var/log/audit=1");
        assert!(parse("apiserver=1").is_err());
        assert!(parse("nope").is_err());
    }

    #[test]
    fn unknown_components_and_kubeadm_keys_fail() {
        assert!(validate(&[opt("kubelet.max-pods=100")]).is_ok());
        assert!(validate(&[opt("kubeadm.pod-network-cidr=10.1.0.0/16")]).is_ok());
        assert!(validate(&[opt("kubeadm.ignore-preflight-errors=Swap")]).is_ok());
        assert!(validate(&[opt("kube-dns.x=1")]).is_err());
        assert!(validate(&[opt("kubeadm.token=abc")]).is_err());
    }

    #[test]
    fn user_options_override_defaults() {
        let v = Version::new(1, 28, 0);
        let opts = vec![opt("scheduler.leader-elect=true"), opt("apiserver.v=5")];
        let sections = component_options(&opts, &v, "Foo=true").expect("options");
        let sched = sections.iter().find(|s| s.section == "scheduler").expect("scheduler");
        assert_eq!(sched.extra_args["leader-elect"], "true");
        assert_eq!(sched.extra_args["feature-gates"], "Foo=true");
        let api = sections.iter().find(|s| s.section == "apiServer").expect("apiserver");
        assert_eq!(api.extra_args["v"], "5");
        assert!(sections.iter().all(|s| s.section != "kubeadm"));
    }

    #[test]
    fn only_command_params_become_flags() {
        let opts = vec![
            opt("kubeadm.pod-network-cidr=10.1.0.0/16"),
            opt("kubeadm.ignore-preflight-errors=Swap"),
            opt("kubeadm.dry-run=true"),
        ];
        assert_eq!(kubeadm_flags(&opts), "--dry-run=true --ignore-preflight-errors=Swap");
    }

    #[test]
    fn feature_gates_are_partitioned() {
        let (kubeadm, rest) = parse_feature_gates("PublicKeysECDSA=true, CSIMigration=false").expect("gates");
        assert_eq!(kubeadm.get("PublicKeysECDSA"), Some(&true));
        assert_eq!(rest, "CSIMigration=false");
        assert!(parse_feature_gates("Foo").is_err());
    }

    #[test]
    fn version_ranged_defaults() {
        let old = for_component(KUBELET, &[], &Version::new(1, 20, 0));
        assert_eq!(old.get("container-runtime").map(String::as_str), Some("remote"));
        let new = for_component(KUBELET, &[], &Version::new(1, 28, 0));
        assert!(!new.contains_key("container-runtime"));
    }
}
