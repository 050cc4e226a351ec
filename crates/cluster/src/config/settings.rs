use std::path::PathBuf;

use super::Store;
use crate::constants;
use crate::localpath::MiniHome;
use crate::out::{Format, Out};

/// Values resolved from the global command line flags, passed explicitly to
/// every operation.
#[derive(Clone, Debug)]
pub struct Settings {
    pub home: MiniHome,
    pub profile: String,
    pub bootstrapper: String,
    pub kubeconfig: PathBuf,
    pub output: Format,
    pub user: String,
    pub rootless: bool,
    pub skip_audit: bool,
}

impl Settings {
    /// Settings for `home` with every other value at its default.
    pub fn new(home: MiniHome) -> Self {
        Settings {
            home,
            profile: constants::DEFAULT_CLUSTER_NAME.to_string(),
            bootstrapper: constants::DEFAULT_BOOTSTRAPPER.to_string(),
            kubeconfig: crate::kubeconfig::path().unwrap_or_default(),
            output: Format::Text,
            user: String::new(),
            rootless: false,
            skip_audit: false,
        }
    }

    pub fn store(&self) -> Store {
        Store::new(self.home.clone())
    }

    pub fn out(&self) -> Out {
        Out::new(self.output)
    }

    /// The `-p` argument to suggest in advice, empty for the default profile.
    pub fn profile_arg(&self) -> String {
        if self.profile == constants::DEFAULT_CLUSTER_NAME {
            String::new()
        } else {
            format!("-p {}", self.profile)
        }
    }
}
