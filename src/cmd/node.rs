use cluster::config::Settings;
use cluster::lifecycle::node::{self, AddOptions};
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
pub enum Node {
    /// Adds a node to the given cluster
    Add {
        #[structopt(long = "control-plane", help = "If set, added node will become a control-plane. Defaults to false. Currently only supported for existing HA (multi-control plane) clusters.")]
        control_plane: bool,

        #[structopt(long = "worker", parse(try_from_str), default_value = "true", help = "If set, added node will be available as worker. Defaults to true.")]
        worker: bool,

        #[structopt(long = "delete-on-failure", help = "If set, delete the current cluster if start fails and try again.")]
        delete_on_failure: bool,

        #[structopt(long = "os", default_value = "linux", help = "OS of the added node, linux or windows[=<version>]. Windows nodes can only be workers.")]
        os: String,
    },
    /// Starts a node in a cluster
    Start {
        name: String,

        #[structopt(long = "delete-on-failure", help = "If set, delete the current cluster if start fails and try again.")]
        delete_on_failure: bool,
    },
    /// Stops a node in a cluster
    Stop { name: String },
    /// Deletes a node from a cluster
    Delete { name: String },
    /// Lists the nodes in the minikube cluster
    List,
}

impl Node {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        match self {
            Node::Add {
                control_plane,
                worker,
                delete_on_failure,
                os,
            } => {
                node::add(
                    settings,
                    &AddOptions {
                        control_plane: *control_plane,
                        worker: *worker,
                        os: os.clone(),
                        delete_on_failure: *delete_on_failure,
                    },
                )
                .await?;
            }
            Node::Start {
                name,
                delete_on_failure,
            } => {
                node::start(settings, name, *delete_on_failure).await?;
            }
            Node::Stop { name } => node::stop(settings, name).await?,
            Node::Delete { name } => node::delete(settings, name).await?,
            Node::List => {
                let mut text = String::new();
                for row in node::list(settings).await? {
                    text.push_str(&format!("{}\t{}\n", row.name, row.ip));
                }
                settings.out().raw(&text);
            }
        }
        Ok(0)
    }
}
