//! Values shared across the host and guest sides of a cluster.

use std::time::Duration;

pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.34.0";
pub const NEWEST_KUBERNETES_VERSION: &str = "v1.35.0";
pub const OLDEST_KUBERNETES_VERSION: &str = "v1.16.0";
/// Marks a cluster started with `--no-kubernetes`.
pub const NO_KUBERNETES_VERSION: &str = "v0.0.0";

pub const DEFAULT_CLUSTER_NAME: &str = "minikube";
pub const DEFAULT_BOOTSTRAPPER: &str = "kubeadm";
pub const DEFAULT_KIC_BASE_IMAGE: &str = "gcr.io/k8s-minikube/kicbase:v0.0.46";
pub const DEFAULT_ISO_URL: &str =
    "https://storage.googleapis.com/minikube/iso/minikube-v1.35.0-amd64.iso";

pub const DOCKER_DAEMON_PORT: u16 = 2376;
pub const API_SERVER_PORT: u16 = 8443;
pub const SSH_PORT: u16 = 22;
pub const REGISTRY_ADDON_PORT: u16 = 5000;

pub const DOCKER: &str = "docker";
pub const CONTAINERD: &str = "containerd";
pub const CRIO: &str = "crio";
pub const DEFAULT_CONTAINER_RUNTIME: &str = DOCKER;

pub const SYSTEMD_CGROUP_DRIVER: &str = "systemd";
pub const CGROUPFS_CGROUP_DRIVER: &str = "cgroupfs";

pub const API_SERVER_NAME: &str = "minikubeCA";
pub const CLUSTER_DNS_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
pub const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
pub const HOST_ALIAS: &str = "host.minikube.internal";
pub const CONTROL_PLANE_ALIAS: &str = "control-plane.minikube.internal";

pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";
pub const DOCKER_CERT_PATH_ENV: &str = "DOCKER_CERT_PATH";
pub const DOCKER_TLS_VERIFY_ENV: &str = "DOCKER_TLS_VERIFY";
pub const MINIKUBE_ACTIVE_DOCKERD_ENV: &str = "MINIKUBE_ACTIVE_DOCKERD";
pub const SSH_AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";
pub const SSH_AGENT_PID_ENV: &str = "SSH_AGENT_PID";
pub const PODMAN_VARLINK_BRIDGE_ENV: &str = "PODMAN_VARLINK_BRIDGE";
pub const PODMAN_CONTAINER_HOST_ENV: &str = "CONTAINER_HOST";
pub const PODMAN_CONTAINER_SSH_KEY_ENV: &str = "CONTAINER_SSHKEY";
pub const MINIKUBE_ACTIVE_PODMAN_ENV: &str = "MINIKUBE_ACTIVE_PODMAN";
pub const MINIKUBE_EXISTING_PREFIX: &str = "MINIKUBE_EXISTING_";
pub const MINIKUBE_ROOTLESS_ENV: &str = "MINIKUBE_ROOTLESS";

pub const DOCKER_DAEMON_ENVS: [&str; 3] =
    [DOCKER_HOST_ENV, DOCKER_TLS_VERIFY_ENV, DOCKER_CERT_PATH_ENV];

pub const KUBERNETES_RELEASE_BINARIES: [&str; 3] = ["kubelet", "kubeadm", "kubectl"];
pub const SHA_SUFFIX: &str = ".sha256";
pub const MOUNT_PROCESS_FILE_NAME: &str = ".mount-process";

/// Namespaces paused and unpaused by default.
pub const DEFAULT_NAMESPACES: [&str; 4] = [
    "kube-system",
    "kubernetes-dashboard",
    "storage-gluster",
    "istio-operator",
];

pub const ALIYUN_MIRROR: &str = "registry.cn-hangzhou.aliyuncs.com/google_containers";

pub const DEFAULT_CERT_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 3);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(6 * 60);
pub const DEFAULT_START_HOST_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Guest-side paths.
pub mod vmpath {
    pub const GUEST_PERSISTENT_DIR: &str = "/var/lib/minikube";
    pub const GUEST_CERTS_DIR: &str = "/var/lib/minikube/certs";
    pub const GUEST_BINARIES_DIR: &str = "/var/lib/minikube/binaries";
    pub const GUEST_IMAGES_DIR: &str = "/var/lib/minikube/images";
    pub const GUEST_KUBECONFIG: &str = "/var/lib/minikube/kubeconfig";
    pub const GUEST_EPHEMERAL_DIR: &str = "/var/tmp/minikube";
    pub const GUEST_KUBEADM_YAML: &str = "/var/tmp/minikube/kubeadm.yaml";
    pub const GUEST_ADDONS_DIR: &str = "/etc/kubernetes/addons";
    pub const GUEST_MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
    pub const GUEST_KUBELET_CONF: &str = "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";
    pub const GUEST_KUBELET_SERVICE: &str = "/lib/systemd/system/kubelet.service";
}
