//! A crate for running local Kubernetes clusters.
//!
//! A cluster is described by a [`config::ClusterConfig`] stored under a
//! profile in the minikube home. Its nodes are machines created by a
//! [`driver`], reached through a [`command::Runner`], and turned into a
//! Kubernetes cluster by a [`bootstrapper::Bootstrapper`]. The
//! [`lifecycle`] module drives all of these for each user-facing command.
//!
//! # Example
//! ```rust,no_run
//! use cluster::config::Settings;
//! use cluster::lifecycle::{self, StartOptions};
//! use cluster::localpath::MiniHome;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new(MiniHome::from_env()?);
//!     let opts = StartOptions {
//!         driver: "docker".to_string(),
//!         nodes: 1,
//!         ..Default::default()
//!     };
//!     lifecycle::start::start(&settings, &opts).await?;
//!     for st in lifecycle::status::status(&settings, None).await? {
//!         println!("{}: {}", st.name, st.host);
//!     }
//!     Ok(())
//! }
//! ```

pub mod addons;
pub mod audit;
pub mod backoff;
pub mod bootstrapper;
pub mod cache;
pub mod command;
pub mod config;
pub mod constants;
pub mod cruntime;
pub mod driver;
pub mod env;
pub mod handle;
pub mod host;
pub mod kubeconfig;
pub mod lifecycle;
pub mod localpath;
pub mod lock;
pub mod machine;
pub mod mount;
pub mod out;
pub mod reason;
pub mod tunnel;

#[doc(inline)]
pub use config::{ClusterConfig, Node, Settings};
#[doc(inline)]
pub use lifecycle::ClusterController;
