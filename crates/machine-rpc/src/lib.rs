//! The wire protocol spoken between minikube and out-of-process machine drivers.
//!
//! A driver plugin is a child process started with [`PLUGIN_ENV_KEY`] set to
//! [`PLUGIN_ENV_VAL`] and [`PLUGIN_ENV_DRIVER_NAME`] naming the driver it should
//! serve. The parent talks to it over the child's stdin/stdout using
//! length-prefixed JSON frames (see [`codec`]). Every frame carries a request id
//! so that replies can be matched to calls.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod codec;
pub mod errors;
pub mod message;
pub mod server;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use errors::RpcError;
#[doc(inline)]
pub use message::{MachineState, Request, Response};
#[doc(inline)]
pub use server::{serve, Handler, ServeOptions};

/// Environment variable that marks a process as a driver plugin.
pub const PLUGIN_ENV_KEY: &str = "MACHINE_PLUGIN_TOKEN";
/// The value [`PLUGIN_ENV_KEY`] must hold for plugin mode to be entered.
pub const PLUGIN_ENV_VAL: &str = "42";
/// Environment variable selecting which driver a plugin process serves.
pub const PLUGIN_ENV_DRIVER_NAME: &str = "MACHINE_PLUGIN_DRIVER_NAME";
/// Prefix of plugin executables discovered on `PATH`.
pub const PLUGIN_BINARY_PREFIX: &str = "docker-machine-driver-";
/// How often the client pings a plugin to keep it alive.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Returns true when the current process was launched as a driver plugin.
pub fn in_plugin_mode() -> bool {
    std::env::var(PLUGIN_ENV_KEY)
        .map(|v| v == PLUGIN_ENV_VAL)
        .unwrap_or(false)
}
