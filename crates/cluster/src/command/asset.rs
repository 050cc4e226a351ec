use std::path::PathBuf;

use anyhow::Context;

/// Where an asset's bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetSource {
    Memory(Vec<u8>),
    File(PathBuf),
}

/// A file to install on a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    pub source: AssetSource,
    pub target_dir: String,
    pub target_name: String,
    /// Octal mode, e.g. `0644`.
    pub permissions: String,
}

impl Asset {
    pub fn memory(
        data: Vec<u8>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Self {
        Asset {
            source: AssetSource::Memory(data),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions: permissions.into(),
        }
    }

    pub fn file(
        path: impl Into<PathBuf>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Self {
        Asset {
            source: AssetSource::File(path.into()),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions: permissions.into(),
        }
    }

    /// The absolute path on the node.
    pub fn target_path(&self) -> String {
        format!(
            "{}/{}",
            self.target_dir.trim_end_matches('/'),
            self.target_name
        )
    }

    pub fn source_description(&self) -> String {
        match &self.source {
            AssetSource::Memory(data) => format!("memory ({} bytes)", data.len()),
            AssetSource::File(p) => p.display().to_string(),
        }
    }

    pub async fn bytes(&self) -> anyhow::Result<Vec<u8>> {
        match &self.source {
            AssetSource::Memory(data) => Ok(data.clone()),
            AssetSource::File(p) => tokio::fs::read(p)
                .await
                .with_context(|| format!("reading {}", p.display())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn file_assets_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("ca.crt");
        std::fs::write(&src, b"pem").expect("write");
        let a = Asset::file(&src, "/var/lib/minikube/certs/", "ca.crt", "0644");
        assert_eq!(a.target_path(), "/var/lib/minikube/certs/ca.crt");
        assert_eq!(a.bytes().await.expect("bytes"), b"pem".to_vec());
        let missing = Asset::file(dir.path().join("nope"), "/x", "y", "0644");
        assert!(missing.bytes().await.is_err());
    }
}
