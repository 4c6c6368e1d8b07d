use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::ArtifactStore;

/// Content-addressed artifact store on the local filesystem.
///
/// Layout:
///   <root>/
///     ab/
///       ab3f...e1   (sha256 of the logical path, hex)
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for a logical path lives on disk.
    pub fn blob_path(&self, logical_path: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(logical_path.as_bytes()));
        self.root.join(&digest[..2]).join(digest)
    }

    /// Store bytes under a logical path, replacing any previous blob.
    pub async fn write(&self, logical_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.blob_path(logical_path);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact {}", logical_path))?;
        tracing::debug!(path = logical_path, blob = %path.display(), "Stored artifact");
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn read(&self, logical_path: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(logical_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read artifact {}", logical_path))
            }
        }
    }
}
