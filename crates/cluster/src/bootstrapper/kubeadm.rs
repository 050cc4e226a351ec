//! The kubeadm bootstrapper.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use semver::Version;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use super::{extra, verify, versions, Bootstrapper};
use crate::cache;
use crate::command::{Asset, Cmd, Runner};
use crate::config::{machine_name, ClusterConfig, Node};
use crate::constants::{self, vmpath};
use crate::cruntime::Manager;
use crate::driver;
use crate::host::certs;
use crate::kubeconfig;
use crate::localpath::MiniHome;
use crate::reason;

const KUBELET_DROP_IN_DIR: &str = "/etc/systemd/system/kubelet.service.d";
const KUBEADM_YAML_NEW: &str = "/var/tmp/minikube/kubeadm.yaml.new";

/// Preflight checks that never pass inside a minikube guest.
const IGNORED_PREFLIGHT: &[&str] = &[
    "DirAvailable--etc-kubernetes-manifests",
    "DirAvailable--var-lib-minikube",
    "DirAvailable--var-lib-minikube-etcd",
    "FileAvailable--etc-kubernetes-manifests-kube-scheduler.yaml",
    "FileAvailable--etc-kubernetes-manifests-kube-apiserver.yaml",
    "FileAvailable--etc-kubernetes-manifests-kube-controller-manager.yaml",
    "FileAvailable--etc-kubernetes-manifests-etcd.yaml",
    "Port-10250",
    "Swap",
    "NumCPU",
    "Mem",
];

/// Additional checks that fail inside a KIC container.
const IGNORED_PREFLIGHT_KIC: &[&str] = &[
    "SystemVerification",
    "FileContent--proc-sys-net-bridge-bridge-nf-call-iptables",
];

const KUBELET_SERVICE: &str = "[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=http://kubernetes.io/docs/

[Service]
ExecStart=/usr/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

fn socket_url(socket: &str) -> String {
    if socket.contains("://") {
        socket.to_string()
    } else {
        format!("unix://{}", socket)
    }
}

/// The kubeadm config API version for `v`.
pub fn config_api_version(v: &Version) -> &'static str {
    match (v.major, v.minor) {
        (1, m) if m >= 31 => "kubeadm.k8s.io/v1beta4",
        (1, m) if m >= 22 => "kubeadm.k8s.io/v1beta3",
        _ => "kubeadm.k8s.io/v1beta2",
    }
}

/// `extraArgs` are a map up to v1beta3 and a list of name/value pairs from
/// v1beta4 on.
fn args_value<'a, I: IntoIterator<Item = (&'a String, &'a String)>>(api: &str, args: I) -> Value {
    if api.ends_with("v1beta4") {
        Value::Array(
            args.into_iter()
                .map(|(k, v)| json!({"name": k, "value": v}))
                .collect(),
        )
    } else {
        Value::Object(
            args.into_iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

fn pod_cidr(cc: &ClusterConfig) -> String {
    extra::get(&cc.kubernetes_config.extra_options, extra::KUBEADM, "pod-network-cidr")
        .unwrap_or(constants::DEFAULT_POD_CIDR)
        .to_string()
}

/// Renders the kubeadm config for the primary control plane `node`.
pub fn render_config(cc: &ClusterConfig, node: &Node, runtime_socket: &str, cgroup_driver: &str) -> anyhow::Result<String> {
    let kc = &cc.kubernetes_config;
    let version = versions::parse(&kc.kubernetes_version)?;
    let api = config_api_version(&version);
    let (kubeadm_gates, component_gates) = extra::parse_feature_gates(&kc.feature_gates)?;
    let components = extra::component_options(&kc.extra_options, &version, &component_gates)?;
    let socket = socket_url(runtime_socket);
    let port = if node.port == 0 { cc.api_server_port } else { node.port };

    let mut node_ip = std::collections::BTreeMap::new();
    node_ip.insert("node-ip".to_string(), node.ip.clone());
    let init = json!({
        "apiVersion": api,
        "kind": "InitConfiguration",
        "localAPIEndpoint": {"advertiseAddress": node.ip, "bindPort": port},
        "bootstrapTokens": [{
            "groups": ["system:bootstrappers:kubeadm:default-node-token"],
            "ttl": "24h0m0s",
            "usages": ["signing", "authentication"],
        }],
        "nodeRegistration": {
            "criSocket": socket,
            "name": machine_name(cc, node),
            "kubeletExtraArgs": args_value(api, node_ip.iter()),
            "taints": [],
        },
    });

    let (ips, names) = certs::apiserver_sans(cc, &node.ip)?;
    let mut cert_sans: Vec<String> = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    for san in ips.iter().map(|ip| ip.to_string()).chain(names) {
        if !cert_sans.contains(&san) {
            cert_sans.push(san);
        }
    }

    let mut cluster = Map::new();
    cluster.insert("apiVersion".into(), json!(api));
    cluster.insert("kind".into(), json!("ClusterConfiguration"));
    let mut apiserver = json!({"certSANs": cert_sans});
    for c in &components {
        let args = args_value(api, c.extra_args.iter());
        match c.section {
            "apiServer" => {
                apiserver["extraArgs"] = args;
            }
            "etcd" => {
                cluster.insert(
                    "etcd".into(),
                    json!({"local": {"dataDir": "/var/lib/minikube/etcd", "extraArgs": args}}),
                );
            }
            "kubeProxy" => {}
            section => {
                cluster.insert(section.into(), json!({ "extraArgs": args }));
            }
        }
    }
    cluster.insert("apiServer".into(), apiserver);
    cluster
        .entry("etcd")
        .or_insert_with(|| json!({"local": {"dataDir": "/var/lib/minikube/etcd"}}));
    cluster.insert("certificatesDir".into(), json!(vmpath::GUEST_CERTS_DIR));
    cluster.insert("clusterName".into(), json!("mk"));
    cluster.insert(
        "controlPlaneEndpoint".into(),
        json!(format!("{}:{}", constants::CONTROL_PLANE_ALIAS, port)),
    );
    cluster.insert("kubernetesVersion".into(), json!(kc.kubernetes_version));
    cluster.insert(
        "networking".into(),
        json!({
            "dnsDomain": kc.dns_domain,
            "podSubnet": pod_cidr(cc),
            "serviceSubnet": kc.service_cidr,
        }),
    );
    if !kc.image_repository.is_empty() {
        cluster.insert("imageRepository".into(), json!(kc.image_repository));
    }
    if !kubeadm_gates.is_empty() {
        cluster.insert("featureGates".into(), json!(kubeadm_gates));
    }

    let mut kubelet = json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "authentication": {"x509": {"clientCAFile": format!("{}/ca.crt", vmpath::GUEST_CERTS_DIR)}},
        "cgroupDriver": cgroup_driver,
        "hairpinMode": "hairpin-veth",
        "runtimeRequestTimeout": "15m",
        "clusterDomain": kc.dns_domain,
        "failSwapOn": false,
        "staticPodPath": vmpath::GUEST_MANIFESTS_DIR,
        "imageGCHighThresholdPercent": 100,
        "evictionHard": {"nodefs.available": "0%", "nodefs.inodesFree": "0%", "imagefs.available": "0%"},
    });
    if (version.major, version.minor) >= (1, 27) {
        kubelet["containerRuntimeEndpoint"] = json!(socket);
    }

    let mut proxy = json!({
        "apiVersion": "kubeproxy.config.k8s.io/v1alpha1",
        "kind": "KubeProxyConfiguration",
        "clusterCIDR": pod_cidr(cc),
        "metricsBindAddress": "0.0.0.0:10249",
        "conntrack": {"maxPerCore": 0, "tcpEstablishedTimeout": "0s", "tcpCloseWaitTimeout": "0s"},
    });
    if let Some(c) = components.iter().find(|c| c.section == "kubeProxy") {
        if let Some(mode) = c.extra_args.get("mode") {
            proxy["mode"] = json!(mode);
        }
    }

    let mut docs = Vec::new();
    for doc in [init, Value::Object(cluster), kubelet, proxy] {
        docs.push(serde_yaml::to_string(&doc)?);
    }
    Ok(docs.join(""))
}

/// The kubelet systemd drop-in for `node`.
pub fn kubelet_drop_in(cc: &ClusterConfig, node: &Node, runtime: &dyn Manager) -> anyhow::Result<String> {
    let version = versions::parse(&node_version(cc, node))?;
    let flags = extra::kubelet_flags(cc, node, &version, &socket_url(&runtime.socket_path()));
    let flags = extra::to_flags(flags.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok(format!(
        "[Unit]\nWants={service}.service\n\n[Service]\nExecStart=\nExecStart={bin}/{version}/kubelet \
         --bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf --config=/var/lib/kubelet/config.yaml \
         --kubeconfig=/etc/kubernetes/kubelet.conf {flags}\n\n[Install]\n",
        service = runtime.kind().service(),
        bin = vmpath::GUEST_BINARIES_DIR,
        version = node_version(cc, node),
        flags = flags,
    ))
}

fn node_version(cc: &ClusterConfig, node: &Node) -> String {
    if node.kubernetes_version.is_empty() {
        cc.kubernetes_config.kubernetes_version.clone()
    } else {
        node.kubernetes_version.clone()
    }
}

/// A command run with the version's binaries first on PATH.
fn with_binaries(version: &str, script: &str) -> Cmd {
    Cmd::shell(format!(
        "sudo env PATH=\"{}/{}:$PATH\" {}",
        vmpath::GUEST_BINARIES_DIR,
        version,
        script
    ))
}

fn kubectl(version: &str, args: &str) -> Cmd {
    Cmd::shell(format!(
        "sudo {}/{}/kubectl --kubeconfig={} {}",
        vmpath::GUEST_BINARIES_DIR,
        version,
        vmpath::GUEST_KUBECONFIG,
        args
    ))
}

/// Runs kubeadm and friends over a [`Runner`].
pub struct Kubeadm {
    runner: Arc<dyn Runner>,
    home: MiniHome,
}

impl Kubeadm {
    pub fn new(home: MiniHome, runner: Arc<dyn Runner>) -> Self {
        Kubeadm { runner, home }
    }

    async fn run(&self, cmd: Cmd) -> anyhow::Result<String> {
        Ok(self.runner.run(cmd).await?.stdout_str())
    }

    async fn ensure_control_plane_alias(&self, ip: &str) -> anyhow::Result<()> {
        let entry = format!("{}\t{}", ip, constants::CONTROL_PLANE_ALIAS);
        self.run(Cmd::shell(format!(
            "grep -qF {q} /etc/hosts || {{ grep -v $'\\t{alias}$' /etc/hosts; echo {q}; }} > /tmp/h.$$ && sudo cp /tmp/h.$$ /etc/hosts",
            q = crate::command::shell_quote(&entry),
            alias = constants::CONTROL_PLANE_ALIAS,
        )))
        .await?;
        Ok(())
    }

    async fn label_primary(&self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()> {
        let now = chrono::Utc::now().format("%Y_%m_%dT%H_%M_%S_0700");
        let labels = format!(
            "minikube.k8s.io/version={} minikube.k8s.io/name={} minikube.k8s.io/primary=true minikube.k8s.io/updated_at={}",
            env!("CARGO_PKG_VERSION"),
            cc.name,
            now
        );
        self.run(kubectl(
            &node_version(cc, node),
            &format!("label --overwrite nodes {} {}", machine_name(cc, node), labels),
        ))
        .await?;
        Ok(())
    }

    async fn elevate_kube_system(&self, version: &str) -> anyhow::Result<()> {
        let res = self
            .runner
            .run(kubectl(
                version,
                "create clusterrolebinding minikube-rbac --clusterrole=cluster-admin --serviceaccount=kube-system:default",
            ))
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if format!("{:#}", e).contains("AlreadyExists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ignored_preflight(cc: &ClusterConfig) -> String {
        let mut checks: Vec<&str> = IGNORED_PREFLIGHT.to_vec();
        if driver::is_kic(&cc.driver) {
            checks.extend_from_slice(IGNORED_PREFLIGHT_KIC);
        }
        if let Some(user) = extra::get(&cc.kubernetes_config.extra_options, extra::KUBEADM, "ignore-preflight-errors") {
            checks.extend(user.split(','));
        }
        checks.join(",")
    }

    fn verify_target(&self, cc: &ClusterConfig, node: &Node, host: &str, port: u16, client: Option<kube::Client>) -> verify::Target<'_> {
        verify::Target {
            runner: self.runner.as_ref(),
            server: kubeconfig::server_url(host, port),
            ca_cert: self.home.ca_cert(),
            client,
            node_name: machine_name(cc, node),
        }
    }

    fn kubeconfig_settings(&self, cc: &ClusterConfig, host: &str, port: u16) -> kubeconfig::Settings {
        kubeconfig::Settings {
            cluster_name: cc.name.clone(),
            namespace: cc.kubernetes_config.namespace.clone(),
            server: kubeconfig::server_url(host, port),
            client_certificate: self.home.client_cert(&cc.name),
            client_key: self.home.client_key(&cc.name),
            certificate_authority: self.home.ca_cert(),
            embed_certs: cc.embed_certs,
            keep_context: cc.keep_context,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Bootstrapper for Kubeadm {
    #[instrument(level = "info", skip_all, fields(node = %node.name))]
    async fn update_node(&self, cc: &ClusterConfig, node: &Node, runtime: &dyn Manager) -> anyhow::Result<()> {
        let version = node_version(cc, node);
        cache::transfer_binaries(&self.home, &version, self.runner.as_ref())
            .await
            .map_err(|e| reason::with_kind(reason::INET_CACHE_BINARIES, e))?;

        let drop_in = kubelet_drop_in(cc, node, runtime)?;
        self.runner
            .copy(&Asset::memory(drop_in.into_bytes(), KUBELET_DROP_IN_DIR, "10-kubeadm.conf", "0644"))
            .await?;
        self.runner
            .copy(&Asset::memory(
                KUBELET_SERVICE.as_bytes().to_vec(),
                "/lib/systemd/system",
                "kubelet.service",
                "0644",
            ))
            .await?;

        if node.control_plane {
            let primary = cc.primary_control_plane()?;
            if primary.name == node.name {
                let yaml = render_config(cc, node, &runtime.socket_path(), constants::SYSTEMD_CGROUP_DRIVER)?;
                self.runner
                    .copy(&Asset::memory(yaml.into_bytes(), vmpath::GUEST_EPHEMERAL_DIR, "kubeadm.yaml.new", "0640"))
                    .await?;
            }
        }
        let cp = cc.primary_control_plane()?;
        let alias_ip = if cc.kubernetes_config.api_server_ha_vip.is_empty() {
            cp.ip
        } else {
            cc.kubernetes_config.api_server_ha_vip.clone()
        };
        self.ensure_control_plane_alias(&alias_ip).await?;
        self.run(Cmd::sudo("systemctl").arg("daemon-reload")).await?;
        self.run(Cmd::sudo("systemctl").args(["start", "kubelet"])).await?;
        Ok(())
    }

    async fn setup_certs(&self, cc: &ClusterConfig, node: &Node) -> anyhow::Result<()> {
        certs::setup_certs(&self.home, cc, node, self.runner.as_ref())
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_CERT, e))
    }

    async fn existing_config(&self) -> bool {
        self.runner
            .run(Cmd::sudo("ls").args([
                "/var/lib/kubelet/kubeadm-flags.env",
                "/var/lib/kubelet/config.yaml",
                "/var/lib/minikube/etcd",
            ]))
            .await
            .is_ok()
    }

    #[instrument(level = "info", skip_all, fields(profile = %cc.name))]
    async fn bootstrap(&self, cc: &ClusterConfig) -> anyhow::Result<()> {
        let node = cc.primary_control_plane()?;
        let version = node_version(cc, &node);
        self.run(Cmd::sudo("cp").args([KUBEADM_YAML_NEW, vmpath::GUEST_KUBEADM_YAML]))
            .await?;
        let flags = extra::kubeadm_flags(&cc.kubernetes_config.extra_options);
        let init = format!(
            "kubeadm init --config {} {} --ignore-preflight-errors={}",
            vmpath::GUEST_KUBEADM_YAML,
            flags,
            Self::ignored_preflight(cc)
        );
        self.runner
            .run(with_binaries(&version, &init))
            .await
            .map_err(|e| reason::with_kind(reason::K8S_INSTALL_FAILED, e))?;
        info!(profile = %cc.name, "kubeadm init finished");

        if let Err(e) = self.label_primary(cc, &node).await {
            warn!(error = %e, "unable to label the control plane node");
        }
        self.elevate_kube_system(&version)
            .await
            .context("granting kube-system cluster-admin")?;
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(profile = %cc.name))]
    async fn restart(&self, cc: &ClusterConfig) -> anyhow::Result<()> {
        let node = cc.primary_control_plane()?;
        let version = node_version(cc, &node);
        let changed = self
            .runner
            .run(Cmd::sudo("diff").args(["-u", vmpath::GUEST_KUBEADM_YAML, KUBEADM_YAML_NEW]))
            .await
            .is_err();
        if changed {
            info!("kubeadm config changed, reconfiguring the control plane");
            self.run(Cmd::sudo("cp").args([KUBEADM_YAML_NEW, vmpath::GUEST_KUBEADM_YAML]))
                .await?;
        } else {
            debug!("kubeadm config unchanged");
        }
        for phase in ["certs all", "kubeconfig all", "kubelet-start", "control-plane all", "etcd local"] {
            self.runner
                .run(with_binaries(
                    &version,
                    &format!("kubeadm init phase {} --config {}", phase, vmpath::GUEST_KUBEADM_YAML),
                ))
                .await
                .map_err(|e| reason::with_kind(reason::GUEST_START, e.context(format!("kubeadm phase {}", phase))))?;
        }
        verify::wait_for_apiserver_process(self.runner.as_ref(), constants::DEFAULT_WAIT_TIMEOUT).await?;
        self.runner
            .run(with_binaries(
                &version,
                &format!("kubeadm init phase addon all --config {}", vmpath::GUEST_KUBEADM_YAML),
            ))
            .await
            .context("kubeadm addon phase")?;
        Ok(())
    }

    async fn join_command(&self, cc: &ClusterConfig) -> anyhow::Result<String> {
        let version = cc.kubernetes_config.kubernetes_version.clone();
        let out = self
            .runner
            .run(with_binaries(&version, "kubeadm token create --print-join-command --ttl=0"))
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_NODE_ADD, e))?;
        let line = out
            .stdout_str()
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("kubeadm join"))
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("kubeadm printed no join command"))?;
        Ok(line)
    }

    #[instrument(level = "info", skip_all, fields(node = %node.name))]
    async fn join(&self, cc: &ClusterConfig, node: &Node, join_cmd: &str, runtime: &dyn Manager) -> anyhow::Result<()> {
        let mut cmd = format!(
            "{} --ignore-preflight-errors=all --cri-socket {} --node-name={}",
            join_cmd,
            socket_url(&runtime.socket_path()),
            machine_name(cc, node)
        );
        if node.control_plane {
            cmd.push_str(&format!(
                " --control-plane --apiserver-advertise-address={} --apiserver-bind-port={}",
                node.ip,
                if node.port == 0 { cc.api_server_port } else { node.port }
            ));
        }
        self.runner
            .run(with_binaries(&node_version(cc, node), &cmd))
            .await
            .map_err(|e| reason::with_kind(reason::GUEST_NODE_ADD, e.context("kubeadm join")))?;
        self.run(Cmd::sudo("systemctl").args(["enable", "kubelet"])).await?;
        self.run(Cmd::sudo("systemctl").args(["start", "kubelet"])).await?;
        Ok(())
    }

    async fn verify(&self, cc: &ClusterConfig, node: &Node, host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
        let components = cc.wait_components();
        if components.is_empty() {
            debug!("not waiting for any components");
            return Ok(());
        }
        let client = match kubeconfig::client_for(&self.kubeconfig_settings(cc, host, port)).await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "unable to build a client for verification");
                None
            }
        };
        let target = self.verify_target(cc, node, host, port, client);
        verify::wait_for(&target, &components, timeout).await
    }

    async fn update_kubeconfig(&self, cc: &ClusterConfig, path: &std::path::Path, host: &str, port: u16) -> anyhow::Result<()> {
        kubeconfig::update(path, &self.kubeconfig_settings(cc, host, port))
            .await
            .map_err(|e| reason::with_kind(reason::HOST_KUBECONFIG_UPDATE, e))
    }

    async fn delete_cluster(&self, cc: &ClusterConfig, runtime: &dyn Manager) -> anyhow::Result<()> {
        let version = cc.kubernetes_config.kubernetes_version.clone();
        let reset = format!("kubeadm reset --cri-socket {} --force", socket_url(&runtime.socket_path()));
        if let Err(e) = self.runner.run(with_binaries(&version, &reset)).await {
            warn!(error = %e, "kubeadm reset failed");
        }
        if let Err(e) = self.run(Cmd::sudo("systemctl").args(["stop", "-f", "kubelet"])).await {
            debug!(error = %e, "stopping kubelet");
        }
        Ok(())
    }

    fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }
}
