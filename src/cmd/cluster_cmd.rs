use std::time::Duration;

use cluster::addons::configure::parse_duration;
use cluster::config::Settings;
use cluster::lifecycle::delete::{self, DeleteOptions};
use cluster::lifecycle::status::{self, Output};
use cluster::lifecycle::{pause, start, stop, StartOptions};
use cluster::out::Icon;
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
pub struct Start {
    #[structopt(long = "driver", alias = "vm-driver", default_value = "", help = "Driver is one of: docker, podman, kvm2, qemu2, virtualbox, hyperkit, hyperv, vfkit, ssh, none (defaults to auto-detect)")]
    driver: String,

    #[structopt(long = "kubernetes-version", default_value = "", help = "The Kubernetes version that the minikube VM will use (ex: v1.2.3, 'stable' for the default, 'latest' for the newest)")]
    kubernetes_version: String,

    #[structopt(long = "container-runtime", short = "c", default_value = "", help = "The container runtime to be used. Valid options: docker, cri-o, containerd")]
    container_runtime: String,

    #[structopt(long = "memory", help = "Amount of RAM to allocate to Kubernetes (format: <number>[<unit>], where unit = b, k, m or g), or 'max'")]
    memory: Option<String>,

    #[structopt(long = "cpus", help = "Number of CPUs allocated to Kubernetes")]
    cpus: Option<u32>,

    #[structopt(long = "disk-size", help = "Disk size allocated to the minikube VM (format: <number>[<unit>], where unit = b, k, m or g)")]
    disk_size: Option<String>,

    #[structopt(long = "nodes", short = "n", default_value = "0", help = "The total number of nodes to spin up")]
    nodes: usize,

    #[structopt(long = "ha", help = "Create a highly available multi-control plane cluster with a minimum of three control-plane nodes")]
    ha: bool,

    #[structopt(long = "wait", help = "Comma separated list of Kubernetes components to verify and wait for after starting a cluster, or 'all'/'none'")]
    wait: Option<String>,

    #[structopt(long = "wait-timeout", parse(try_from_str = parse_duration), help = "Max time to wait per Kubernetes or host to be healthy (e.g. 6m0s)")]
    wait_timeout: Option<Duration>,

    #[structopt(long = "addons", use_delimiter = true, help = "Enable addons, see `minikube addons list` for a list of valid addon names")]
    addons: Vec<String>,

    #[structopt(long = "extra-config", help = "A set of key=value pairs that describe configuration that may be passed to different components, e.g. kubelet.max-pods=100")]
    extra_config: Vec<String>,

    #[structopt(long = "feature-gates", default_value = "", help = "A set of key=value pairs that describe feature gates for alpha/experimental features")]
    feature_gates: String,

    #[structopt(long = "image-repository", default_value = "", help = "Alternative image repository to pull docker images from")]
    image_repository: String,

    #[structopt(long = "image-mirror-country", default_value = "", help = "Country code of the image mirror to be used. Leave empty to use the global one")]
    image_mirror_country: String,

    #[structopt(long = "insecure-registry", help = "Insecure Docker registries to pass to the Docker daemon")]
    insecure_registry: Vec<String>,

    #[structopt(long = "registry-mirror", help = "Registry mirrors to pass to the Docker daemon")]
    registry_mirror: Vec<String>,

    #[structopt(long = "docker-env", help = "Environment variables to pass to the Docker daemon (format: key=value)")]
    docker_env: Vec<String>,

    #[structopt(long = "docker-opt", help = "Specify arbitrary flags to pass to the Docker daemon (format: key=value)")]
    docker_opt: Vec<String>,

    #[structopt(long = "apiserver-port", help = "The apiserver listening port")]
    apiserver_port: Option<u16>,

    #[structopt(long = "apiserver-names", help = "A set of apiserver names which are used in the generated certificate for kubernetes")]
    apiserver_names: Vec<String>,

    #[structopt(long = "service-cluster-ip-range", default_value = "", help = "The CIDR to be used for service cluster IPs")]
    service_cidr: String,

    #[structopt(long = "network", default_value = "", help = "network to run minikube with")]
    network: String,

    #[structopt(long = "keep-context", help = "This will keep the existing kubectl context and will create a minikube context")]
    keep_context: bool,

    #[structopt(long = "embed-certs", help = "if true, will embed the certs in kubeconfig")]
    embed_certs: bool,

    #[structopt(long = "mount", help = "This will start the mount daemon and automatically mount files into minikube")]
    mount: bool,

    #[structopt(long = "mount-string", default_value = "", help = "The argument to pass the minikube mount command on start")]
    mount_string: String,

    #[structopt(long = "cache-images", parse(try_from_str), default_value = "true", help = "If true, cache docker images for the current bootstrapper and load them into the machine")]
    cache_images: bool,

    #[structopt(long = "download-only", help = "If true, only download and cache files for later use - don't install or start anything")]
    download_only: bool,

    #[structopt(long = "delete-on-failure", help = "If set, delete the current cluster if start fails and try again")]
    delete_on_failure: bool,

    #[structopt(long = "force", help = "Force minikube to perform possibly dangerous operations")]
    force: bool,
}

impl Start {
    fn options(&self) -> StartOptions {
        StartOptions {
            driver: self.driver.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            container_runtime: self.container_runtime.clone(),
            memory: self.memory.clone(),
            cpus: self.cpus,
            disk_size: self.disk_size.clone(),
            nodes: self.nodes,
            ha: self.ha,
            wait: self.wait.clone(),
            wait_timeout: self.wait_timeout,
            addons: self.addons.clone(),
            extra_config: self.extra_config.clone(),
            feature_gates: self.feature_gates.clone(),
            image_repository: self.image_repository.clone(),
            image_mirror_country: self.image_mirror_country.clone(),
            insecure_registry: self.insecure_registry.clone(),
            registry_mirror: self.registry_mirror.clone(),
            docker_env: self.docker_env.clone(),
            docker_opt: self.docker_opt.clone(),
            apiserver_port: self.apiserver_port,
            apiserver_names: self.apiserver_names.clone(),
            service_cidr: self.service_cidr.clone(),
            network: self.network.clone(),
            keep_context: self.keep_context,
            embed_certs: self.embed_certs,
            mount: self.mount,
            mount_string: self.mount_string.clone(),
            cache_images: self.cache_images,
            download_only: self.download_only,
            delete_on_failure: self.delete_on_failure,
            force: self.force,
        }
    }

    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        start::start(settings, &self.options()).await?;
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Stop {
    #[structopt(long = "all", help = "Set flag to stop all profiles (clusters)")]
    all: bool,
}

impl Stop {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let stopped = stop::stop(settings, self.all).await?;
        settings
            .out()
            .step(Icon::Stopping, format!("{} node(s) stopped.", stopped));
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Delete {
    #[structopt(long = "all", help = "Set flag to delete all profiles")]
    all: bool,

    #[structopt(long = "purge", help = "Set this flag to delete the '.minikube' folder from your user directory.")]
    purge: bool,
}

impl Delete {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        delete::delete(
            settings,
            &DeleteOptions {
                all: self.all,
                purge: self.purge,
            },
        )
        .await?;
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Status {
    #[structopt(
        short = "f",
        long = "format",
        help = "Go template format string for the status output, e.g. {{.Host}}"
    )]
    format: Option<String>,

    #[structopt(short = "n", long = "node", help = "The node to check status for. Defaults to control plane.")]
    node: Option<String>,
}

impl Status {
    /// Prints every node's status. The exit code carries the bit flags of
    /// whatever is not running.
    pub async fn run(&self, settings: &Settings, output: Option<&str>) -> anyhow::Result<i32> {
        let output = Output::from_flags(output, self.format.as_deref())?;
        let statuses = status::status(settings, self.node.as_deref()).await?;
        let rendered = status::render(&statuses, &output)?;
        settings.out().raw(&rendered);
        if output == Output::Json && !rendered.ends_with('\n') {
            settings.out().raw("\n");
        }
        Ok(status::exit_code(&statuses))
    }
}

#[derive(StructOpt, Clone, Debug)]
pub struct Pause {
    #[structopt(short = "A", long = "all-namespaces", help = "If set, pause all namespaces")]
    all_namespaces: bool,

    #[structopt(short = "n", long = "namespaces", use_delimiter = true, help = "namespaces to pause")]
    namespaces: Vec<String>,
}

impl Pause {
    pub async fn run(&self, settings: &Settings, pause: bool) -> anyhow::Result<i32> {
        let ids = pause::run(settings, pause, self.all_namespaces, &self.namespaces).await?;
        let namespaces = pause::namespaces(self.all_namespaces, &self.namespaces);
        let verb = if pause { "Paused" } else { "Unpaused" };
        let scope = if namespaces.is_empty() {
            "all namespaces".to_string()
        } else {
            namespaces.join(", ")
        };
        settings.out().step(
            if pause { Icon::Pause } else { Icon::Unpause },
            format!("{} {} containers in: {}", verb, ids.len(), scope),
        );
        Ok(0)
    }
}
