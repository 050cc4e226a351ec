//! Handles for long-running host-side services (tunnels, the mount server)
//! that must be stopped and awaited before the process exits.

mod stopper;

pub use stopper::{StopHandler, TaskHandle};
