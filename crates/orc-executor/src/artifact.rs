//! Content-addressed artifact blob sink (spec §4.7 step 3, §9 "Deterministic
//! replay"). Pluggable backends are out of scope; this is the single
//! filesystem sink the worker writes through.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::ExecutorError;

/// sha256 hex digest of a blob, used as its address.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes `bytes` under its content hash, returning that hash. Writing
    /// the same bytes twice is a no-op the second time.
    async fn put(&self, bytes: &[u8]) -> Result<String, ExecutorError>;

    async fn get(&self, hash: &str) -> Result<Vec<u8>, ExecutorError>;
}

/// Stores blobs as files named by their hash under `root`, two levels of
/// hash-prefix fan-out to keep any one directory small.
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, ExecutorError> {
        let hash = content_hash(bytes);
        let path = self.path_for(&hash);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ExecutorError::Artifact(e.to_string()))?
        {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::Artifact(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| ExecutorError::Artifact(e.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ExecutorError::Artifact(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ExecutorError::Artifact(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ExecutorError::Artifact(e.to_string()))?;
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>, ExecutorError> {
        let path = self.path_for(hash);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ExecutorError::Artifact(format!("artifact {hash} unreadable: {e}")))
    }
}

/// Hashes a step's normalized input, used as the `input_hash` component of
/// the replay key `(step_def_id, attempt, input_hash)`.
pub fn input_hash(input: &serde_json::Value) -> Result<String, ExecutorError> {
    let canonical =
        serde_json::to_vec(input).map_err(|e| ExecutorError::Validation(e.to_string()))?;
    Ok(content_hash(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_content_addressed_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let hash_a = store.put(b"hello").await.unwrap();
        let hash_b = store.put(b"hello").await.unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(store.get(&hash_a).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn different_bytes_hash_differently() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let hash_a = store.put(b"hello").await.unwrap();
        let hash_b = store.put(b"world").await.unwrap();
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn input_hash_is_stable_for_same_value() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"x": 1, "y": 2});
        assert_eq!(input_hash(&a).unwrap(), input_hash(&b).unwrap());
    }
}
