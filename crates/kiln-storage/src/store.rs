use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

/// Bucketed object storage.
///
/// Object paths are `/`-separated keys relative to a bucket, e.g.
/// `user-1/portrait/samples/0001.jpg`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend identifier used in logs (e.g. "supabase", "local").
    fn id(&self) -> &'static str;

    async fn download(&self, bucket: &str, path: &str) -> StorageResult<Bytes>;

    async fn upload(&self, bucket: &str, path: &str, body: Bytes, content_type: &str) -> StorageResult<()>;

    /// Upload the file at `local`. The default buffers it in memory; backends
    /// that can stream from disk override this.
    async fn upload_file(&self, bucket: &str, path: &str, local: &Path, content_type: &str) -> StorageResult<()> {
        let body = tokio::fs::read(local).await?;
        self.upload(bucket, path, Bytes::from(body), content_type).await
    }

    /// Public URL of an object, if the backend can address objects publicly.
    fn public_url(&self, bucket: &str, path: &str) -> Option<String>;
}

/// Best-guess MIME type for an object path.
pub fn content_type_for(path: &str) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}

/// Split an object path into its segments, rejecting traversal and empty keys.
pub(crate) fn object_segments(path: &str) -> StorageResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if segments.iter().any(|s| *s == ".." || *s == ".") {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}
