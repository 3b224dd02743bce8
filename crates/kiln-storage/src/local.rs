use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectStore, object_segments};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Filesystem-backed object store.
///
/// Each bucket is a directory under `root`; object paths map onto nested
/// directories below it.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object to its file path on disk.
    pub fn object_path(&self, bucket: &str, path: &str) -> StorageResult<PathBuf> {
        let mut out = self.root.join(bucket);
        for segment in object_segments(path)? {
            out.push(segment);
        }
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn id(&self) -> &'static str {
        "local"
    }

    async fn download(&self, bucket: &str, path: &str) -> StorageResult<Bytes> {
        let file = self.object_path(bucket, path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { bucket: bucket.to_string(), path: path.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(&self, bucket: &str, path: &str, body: Bytes, _content_type: &str) -> StorageResult<()> {
        let file = self.object_path(bucket, path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &body).await?;
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, path: &str, local: &Path, _content_type: &str) -> StorageResult<()> {
        let file = self.object_path(bucket, path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &file).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> Option<String> {
        let file = self.object_path(bucket, path).ok()?;
        let absolute = if file.is_absolute() { file } else { std::env::current_dir().ok()?.join(file) };
        Some(format!("file://{}", absolute.display()))
    }
}
