//! Paths under the minikube home directory.
//!
//! Everything minikube persists lives below a single root, resolved from
//! `$MINIKUBE_HOME` or `$HOME/.minikube`. Code never joins path segments onto
//! the root by hand; it asks a [`MiniHome`] for the path it needs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use dirs::home_dir;

/// Overrides the parent of the `.minikube` directory.
pub const MINIKUBE_HOME: &str = "MINIKUBE_HOME";
/// Overrides where machine directories are stored.
pub const MACHINE_STORAGE_PATH: &str = "MACHINE_STORAGE_PATH";

const DOT_MINIKUBE: &str = ".minikube";

/// Resolves the minikube home from the environment.
pub fn mini_path() -> anyhow::Result<PathBuf> {
    resolve(std::env::var_os(MINIKUBE_HOME), home_dir()).ok_or_else(|| {
        anyhow::anyhow!("Unable to get home dir, set ${} to choose one", MINIKUBE_HOME)
    })
}

fn resolve(env: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    match env.filter(|e| !e.is_empty()) {
        Some(e) => {
            let p = PathBuf::from(e);
            if p.file_name().map(|f| f == DOT_MINIKUBE).unwrap_or(false) {
                Some(p)
            } else {
                Some(p.join(DOT_MINIKUBE))
            }
        }
        None => home.map(|h| h.join(DOT_MINIKUBE)),
    }
}

/// Replaces `:` in image references so they can be used as file names.
pub fn sanitize_cache_dir(image: &str) -> String {
    if cfg!(windows) && has_windows_drive_letter(image) {
        return format!("{}{}", &image[..2], image[2..].replace(':', "_"));
    }
    image.replace(':', "_")
}

fn has_windows_drive_letter(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'\\' || b[2] == b'/')
}

/// The minikube home directory and the layout beneath it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiniHome {
    root: PathBuf,
    machines: PathBuf,
    config: Option<PathBuf>,
}

impl MiniHome {
    /// A home rooted at `root`, with machines stored in `root/machines`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let machines = root.join("machines");
        MiniHome {
            root,
            machines,
            config: None,
        }
    }

    /// Resolves the home from `$MINIKUBE_HOME`, `$HOME` and
    /// `$MACHINE_STORAGE_PATH`.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut home = MiniHome::new(mini_path()?);
        if let Some(p) = std::env::var_os(MACHINE_STORAGE_PATH).filter(|p| !p.is_empty()) {
            home.machines = PathBuf::from(p).join("machines");
        }
        Ok(home)
    }

    /// The `.minikube` directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `parts` onto the root.
    pub fn make<I, P>(&self, parts: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut p = self.root.clone();
        for part in parts {
            p.push(part);
        }
        p
    }

    /// Reads and writes the user-wide settings at `path` instead.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// The user-wide settings file.
    pub fn config_file(&self) -> PathBuf {
        match &self.config {
            Some(p) => p.clone(),
            None => self.make(["config", "config.json"]),
        }
    }

    /// The directory holding every profile.
    pub fn profiles_dir(&self) -> PathBuf {
        self.make(["profiles"])
    }

    /// One profile's directory.
    pub fn profile(&self, name: &str) -> PathBuf {
        self.profiles_dir().join(name)
    }

    /// One profile's `config.json`.
    pub fn profile_config(&self, name: &str) -> PathBuf {
        self.profile(name).join("config.json")
    }

    /// The directory holding every machine.
    pub fn machines_dir(&self) -> &Path {
        &self.machines
    }

    /// One machine's directory.
    pub fn machine(&self, name: &str) -> PathBuf {
        self.machines.join(name)
    }

    /// Shared certificates (CA, client) used by the docker daemons in guests.
    pub fn certs_dir(&self) -> PathBuf {
        self.make(["certs"])
    }

    /// The cluster CA certificate.
    pub fn ca_cert(&self) -> PathBuf {
        self.make(["ca.crt"])
    }

    /// The cluster CA key.
    pub fn ca_key(&self) -> PathBuf {
        self.make(["ca.key"])
    }

    /// The front-proxy CA certificate.
    pub fn proxy_ca_cert(&self) -> PathBuf {
        self.make(["proxy-client-ca.crt"])
    }

    /// The front-proxy CA key.
    pub fn proxy_ca_key(&self) -> PathBuf {
        self.make(["proxy-client-ca.key"])
    }

    /// The admin client certificate for a profile.
    pub fn client_cert(&self, profile: &str) -> PathBuf {
        self.profile(profile).join("client.crt")
    }

    /// The admin client key for a profile.
    pub fn client_key(&self, profile: &str) -> PathBuf {
        self.profile(profile).join("client.key")
    }

    /// Artifact cache root.
    pub fn cache_dir(&self) -> PathBuf {
        self.make(["cache"])
    }

    /// Where running tunnels register themselves.
    pub fn tunnels_dir(&self) -> PathBuf {
        self.make(["tunnels.d"])
    }

    /// Log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.make(["logs"])
    }

    /// The audit log of every invocation.
    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir().join("audit.json")
    }

    /// The pid file of a profile's mount process.
    pub fn mount_pid(&self, profile: &str) -> PathBuf {
        self.profile(profile).join(".mount-process")
    }

    /// Addon manifests written by the user to be synced into guests.
    pub fn addons_dir(&self) -> PathBuf {
        self.make(["addons"])
    }

    /// Files under this directory are copied verbatim into every guest.
    pub fn files_dir(&self) -> PathBuf {
        self.make(["files"])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn home_defaults_to_dot_minikube() {
        assert_eq!(
            resolve(None, Some(PathBuf::from("/home/me"))),
            Some(PathBuf::from("/home/me/.minikube"))
        );
    }

    #[test]
    fn env_gets_dot_minikube_appended() {
        assert_eq!(
            resolve(Some("/data".into()), Some(PathBuf::from("/home/me"))),
            Some(PathBuf::from("/data/.minikube"))
        );
        assert_eq!(
            resolve(Some("/data/.minikube".into()), None),
            Some(PathBuf::from("/data/.minikube"))
        );
    }

    #[test]
    fn empty_env_is_ignored() {
        assert_eq!(
            resolve(Some("".into()), Some(PathBuf::from("/h"))),
            Some(PathBuf::from("/h/.minikube"))
        );
        assert_eq!(resolve(None, None), None);
    }

    #[test]
    fn layout() {
        let home = MiniHome::new("/m");
        assert_eq!(home.profile_config("p1"), PathBuf::from("/m/profiles/p1/config.json"));
        assert_eq!(home.machine("p1-m02"), PathBuf::from("/m/machines/p1-m02"));
        assert_eq!(home.config_file(), PathBuf::from("/m/config/config.json"));
        assert_eq!(home.make(["cache", "iso"]), PathBuf::from("/m/cache/iso"));
    }

    #[test]
    fn cache_names_lose_colons() {
        assert_eq!(
            sanitize_cache_dir("k8s.gcr.io/pause:3.2"),
            "k8s.gcr.io/pause_3.2"
        );
    }
}
