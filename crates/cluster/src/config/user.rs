//! The user-wide settings file, `<home>/config/config.json`.
//!
//! It is a loosely typed map. Only keys in [`SETTINGS`] can be set from the
//! command line, and each value is checked by that setting's validators.
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::debug;

use super::profile::{create_private_dir, to_json_indented, write_private};
use crate::localpath::MiniHome;
use crate::lock::FileLock;

/// The key holding the user-wide cached image set.
pub const CACHE: &str = "cache";
/// The key holding the active profile.
pub const PROFILE: &str = "profile";

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// How a setting's value is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetterKind {
    String,
    Int,
    Bool,
    /// A set of keys, stored as a map to null.
    Map,
}

/// A check run against a value before it is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validator {
    Driver,
    Cidr,
    DiskSize,
    Positive,
    Url,
    UrlExists,
    Path,
    Runtime,
}

/// A recognized key of the user config.
#[derive(Clone, Copy, Debug)]
pub struct Setting {
    pub name: &'static str,
    pub kind: SetterKind,
    pub validators: &'static [Validator],
    /// Changing the value only affects clusters after a restart.
    pub requires_restart: bool,
}

const fn setting(name: &'static str, kind: SetterKind) -> Setting {
    Setting {
        name,
        kind,
        validators: &[],
        requires_restart: false,
    }
}

const fn checked(name: &'static str, kind: SetterKind, validators: &'static [Validator]) -> Setting {
    Setting {
        name,
        kind,
        validators,
        requires_restart: false,
    }
}

const fn restart(mut s: Setting) -> Setting {
    s.requires_restart = true;
    s
}

/// Every key that `config set` accepts.
pub const SETTINGS: &[Setting] = &[
    restart(checked("driver", SetterKind::String, &[Validator::Driver])),
    restart(checked("vm-driver", SetterKind::String, &[Validator::Driver])),
    restart(checked("container-runtime", SetterKind::String, &[Validator::Runtime])),
    restart(setting("feature-gates", SetterKind::String)),
    checked("v", SetterKind::Int, &[Validator::Positive]),
    restart(checked("cpus", SetterKind::Int, &[Validator::Positive])),
    restart(checked("disk-size", SetterKind::String, &[Validator::DiskSize])),
    checked("host-only-cidr", SetterKind::String, &[Validator::Cidr]),
    restart(checked("memory", SetterKind::Int, &[Validator::Positive])),
    checked("log_dir", SetterKind::String, &[Validator::Path]),
    setting("kubernetes-version", SetterKind::String),
    checked("iso-url", SetterKind::String, &[Validator::Url, Validator::UrlExists]),
    setting("WantUpdateNotification", SetterKind::Bool),
    setting("ReminderWaitPeriodInHours", SetterKind::Int),
    setting("WantNoneDriverWarning", SetterKind::Bool),
    setting("WantVirtualBoxDriverWarning", SetterKind::Bool),
    setting(PROFILE, SetterKind::String),
    setting("bootstrapper", SetterKind::String),
    setting("insecure-registry", SetterKind::String),
    setting("hyperv-virtual-switch", SetterKind::String),
    setting("disable-driver-mounts", SetterKind::Bool),
    setting(CACHE, SetterKind::Map),
    setting("EmbedCerts", SetterKind::Bool),
    setting("native-ssh", SetterKind::Bool),
    setting("rootless", SetterKind::Bool),
    restart(setting("MaxAuditEntries", SetterKind::Int)),
];

/// Looks up a setting by name.
pub fn find_setting(name: &str) -> anyhow::Result<&'static Setting> {
    SETTINGS.iter().find(|s| s.name == name).ok_or_else(|| {
        crate::reason::usage(format!(
            "property name {:?} not found. Configurable fields:\n{}",
            name,
            configurable_fields()
        ))
    })
}

/// A bullet list of every configurable key.
pub fn configurable_fields() -> String {
    SETTINGS
        .iter()
        .map(|s| format!(" * {}", s.name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The user-wide settings map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserConfig {
    values: BTreeMap<String, Value>,
}

impl UserConfig {
    /// Reads the settings file. A missing file is an empty config.
    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let values = serde_json::from_slice(&data)
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(UserConfig { values })
    }

    /// Writes the settings file.
    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            create_private_dir(dir).await?;
        }
        write_private(path, &to_json_indented(&self.values)?).await
    }

    /// Runs a read-modify-write cycle under the home config lock.
    pub async fn update<T, F>(home: &MiniHome, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut UserConfig) -> anyhow::Result<T>,
    {
        let path = home.config_file();
        let _lock = FileLock::acquire(home.make(["config", ".lock"]), LOCK_TIMEOUT).await?;
        let mut cfg = UserConfig::read(&path).await?;
        let out = f(&mut cfg)?;
        cfg.write(&path).await?;
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A string value, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Stores a raw command line value for a known setting, converting it to
    /// the setting's type. Validators must have been run by the caller.
    pub fn set(&mut self, name: &str, raw: &str) -> anyhow::Result<()> {
        let s = find_setting(name)?;
        let value = match s.kind {
            SetterKind::String => Value::String(raw.to_string()),
            SetterKind::Int => Value::from(
                raw.parse::<i64>()
                    .with_context(|| format!("{}: {:?} is not an integer", name, raw))?,
            ),
            SetterKind::Bool => Value::Bool(
                raw.parse::<bool>()
                    .with_context(|| format!("{}: {:?} is not a boolean", name, raw))?,
            ),
            SetterKind::Map => {
                anyhow::bail!("{} holds a set and cannot be assigned a single value", name)
            }
        };
        debug!(%name, %value, "setting user config value");
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Removes a key. Unknown keys are an error, absent ones are not.
    pub fn unset(&mut self, name: &str) -> anyhow::Result<()> {
        find_setting(name)?;
        self.values.remove(name);
        Ok(())
    }

    /// The keys of a map-valued setting.
    pub fn map_keys(&self, name: &str) -> BTreeSet<String> {
        match self.values.get(name) {
            Some(Value::Object(m)) => m.keys().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Unions `keys` into a map-valued setting.
    pub fn add_to_map<I: IntoIterator<Item = String>>(&mut self, name: &str, keys: I) {
        let mut current = self.map_keys(name);
        current.extend(keys);
        self.set_map(name, current);
    }

    /// Removes `keys` from a map-valued setting.
    pub fn delete_from_map<'a, I: IntoIterator<Item = &'a str>>(&mut self, name: &str, keys: I) {
        if !self.values.contains_key(name) {
            return;
        }
        let mut current = self.map_keys(name);
        for k in keys {
            current.remove(k);
        }
        self.set_map(name, current);
    }

    fn set_map(&mut self, name: &str, keys: BTreeSet<String>) {
        let map = keys.into_iter().map(|k| (k, Value::Null)).collect();
        self.values.insert(name.to_string(), Value::Object(map));
    }

    /// The user-wide cached image set.
    pub fn cached_images(&self) -> BTreeSet<String> {
        self.map_keys(CACHE)
    }
}

/// Runs every validator of `setting` against `value`.
pub async fn validate(setting: &Setting, value: &str) -> anyhow::Result<()> {
    for v in setting.validators {
        check(*v, setting.name, value)
            .await
            .map_err(|e| crate::reason::usage(format!("{:#}", e)))?;
    }
    Ok(())
}

/// The notices to print after a setting changed.
pub fn callbacks(setting: &Setting) -> Vec<String> {
    if setting.requires_restart {
        vec![
            "These changes will take effect upon a minikube delete and then a minikube start"
                .to_string(),
        ]
    } else {
        Vec::new()
    }
}

async fn check(v: Validator, name: &str, value: &str) -> anyhow::Result<()> {
    match v {
        Validator::Driver => {
            if !crate::driver::supported(value) {
                anyhow::bail!(
                    "[{}] {:?} is not a supported driver: choose one of {}",
                    name,
                    value,
                    crate::driver::supported_drivers().join(", ")
                );
            }
        }
        Validator::Runtime => {
            if crate::cruntime::RuntimeKind::from_name(value).is_none() {
                anyhow::bail!("[{}] {:?} is not a supported container runtime", name, value);
            }
        }
        Validator::Cidr => is_valid_cidr(value).with_context(|| format!("[{}]", name))?,
        Validator::DiskSize => {
            let mib = super::parse_size_mib(value).with_context(|| format!("[{}]", name))?;
            if mib < MIN_DISK_MIB {
                anyhow::bail!("[{}] requested disk size {}MiB is less than the minimum of {}MiB", name, mib, MIN_DISK_MIB);
            }
        }
        Validator::Positive => {
            let n: i64 = value
                .parse()
                .with_context(|| format!("[{}] {:?} is not an integer", name, value))?;
            if n < 0 {
                anyhow::bail!("[{}] {} must be >= 0", name, n);
            }
        }
        Validator::Url => {
            url::Url::parse(value).with_context(|| format!("[{}] {:?} is not a valid URL", name, value))?;
        }
        Validator::UrlExists => url_exists(name, value).await?,
        Validator::Path => {
            if tokio::fs::metadata(value).await.is_err() {
                anyhow::bail!("[{}] {} does not exist", name, value);
            }
        }
    }
    Ok(())
}

const MIN_DISK_MIB: u64 = 2000;

fn is_valid_cidr(value: &str) -> anyhow::Result<()> {
    let (ip, bits) = value
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("{:?} is not a CIDR: missing prefix length", value))?;
    let ip: IpAddr = ip
        .parse()
        .with_context(|| format!("{:?} is not a CIDR", value))?;
    let bits: u8 = bits
        .parse()
        .with_context(|| format!("{:?} is not a CIDR", value))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    if bits > max {
        anyhow::bail!("{:?} is not a CIDR: prefix longer than {}", value, max);
    }
    Ok(())
}

async fn url_exists(name: &str, value: &str) -> anyhow::Result<()> {
    let u = url::Url::parse(value).with_context(|| format!("[{}] {:?} is not a valid URL", name, value))?;
    match u.scheme() {
        "file" => {
            let p = u
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("[{}] {} is not a file path", name, value))?;
            if tokio::fs::metadata(&p).await.is_err() {
                anyhow::bail!("[{}] {} does not exist", name, p.display());
            }
        }
        "http" | "https" => {
            let resp = reqwest::Client::new()
                .head(u)
                .send()
                .await
                .with_context(|| format!("[{}] fetching {}", name, value))?;
            if !resp.status().is_success() {
                anyhow::bail!("[{}] {} returned {}", name, value, resp.status());
            }
        }
        other => anyhow::bail!("[{}] unsupported URL scheme {:?}", name, other),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = UserConfig::read(&dir.path().join("config.json"))
            .await
            .expect("read");
        assert!(cfg.values().is_empty());
    }

    #[test]
    fn typed_setters() {
        let mut cfg = UserConfig::default();
        cfg.set("cpus", "4").expect("int");
        cfg.set("EmbedCerts", "true").expect("bool");
        cfg.set("profile", "dev").expect("string");
        assert_eq!(cfg.get("cpus"), Some(&Value::from(4)));
        assert_eq!(cfg.get_bool("EmbedCerts"), Some(true));
        assert_eq!(cfg.get_str("profile"), Some("dev"));
        assert!(cfg.set("cpus", "four").is_err());
        assert!(cfg.set("no-such-key", "x").is_err());
        assert!(cfg.set(CACHE, "x").is_err());
        cfg.unset("cpus").expect("unset");
        assert!(cfg.get("cpus").is_none());
    }

    #[test]
    fn cached_image_set_laws() {
        let mut a = UserConfig::default();
        a.add_to_map(CACHE, vec!["alpine:3".to_string()]);
        a.add_to_map(CACHE, vec!["busybox".to_string()]);
        let mut b = UserConfig::default();
        b.add_to_map(CACHE, vec!["alpine:3".to_string(), "busybox".to_string()]);
        assert_eq!(a.cached_images(), b.cached_images());

        let before = a.cached_images();
        a.add_to_map(CACHE, vec!["nginx".to_string()]);
        a.delete_from_map(CACHE, vec!["nginx"]);
        assert_eq!(a.cached_images(), before);

        let mut empty = UserConfig::default();
        empty.delete_from_map(CACHE, vec!["nginx"]);
        assert!(empty.get(CACHE).is_none());
    }

    #[tokio::test]
    async fn validators() {
        let cidr = find_setting("host-only-cidr").expect("setting");
        assert!(validate(cidr, "192.168.99.1/24").await.is_ok());
        assert!(validate(cidr, "192.168.99.1").await.is_err());
        assert!(validate(cidr, "10.0.0.0/33").await.is_err());

        let disk = find_setting("disk-size").expect("setting");
        assert!(validate(disk, "20g").await.is_ok());
        assert!(validate(disk, "1000mb").await.is_err());

        let cpus = find_setting("cpus").expect("setting");
        assert!(validate(cpus, "-1").await.is_err());
        assert_eq!(callbacks(cpus).len(), 1);

        let driver = find_setting("driver").expect("setting");
        assert!(validate(driver, "docker").await.is_ok());
        assert!(validate(driver, "floppy").await.is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let iso = find_setting("iso-url").expect("setting");
        let missing = url::Url::from_file_path(dir.path().join("missing.iso")).expect("url");
        assert!(validate(iso, missing.as_str()).await.is_err());
        std::fs::write(dir.path().join("present.iso"), b"iso").expect("write");
        let present = url::Url::from_file_path(dir.path().join("present.iso")).expect("url");
        assert!(validate(iso, present.as_str()).await.is_ok());
    }

    #[tokio::test]
    async fn update_round_trips_under_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = MiniHome::new(dir.path());
        UserConfig::update(&home, |c| c.set(PROFILE, "dev"))
            .await
            .expect("update");
        let cfg = UserConfig::read(&home.config_file()).await.expect("read");
        assert_eq!(cfg.get_str(PROFILE), Some("dev"));
        assert!(!home.make(["config", ".lock"]).exists());
    }
}
