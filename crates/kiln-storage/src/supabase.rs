//! Supabase Storage client.
//!
//! Talks to the Storage REST API directly:
//! - download: `GET  {base}/storage/v1/object/{bucket}/{path}`
//! - upload:   `POST {base}/storage/v1/object/{bucket}/{path}` (upsert)
//! - public:   `{base}/storage/v1/object/public/{bucket}/{path}`

use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectStore, object_segments};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Response, StatusCode};
use std::env;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Supabase Storage backend.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    /// Project URL (e.g. "https://abc.supabase.co"), without trailing slash.
    base_url: String,
    /// Service role key used for both `apikey` and bearer auth.
    api_key: String,
    client: Client,
}

impl SupabaseStorage {
    /// Creates a client for the given project URL and key.
    ///
    /// Transfers of large checkpoints can take a while, so the request
    /// timeout is generous.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| StorageError::Request(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Builds a client from `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`
    /// (falling back to `SUPABASE_KEY`).
    ///
    /// Returns `Ok(None)` when the variables are not set.
    #[allow(clippy::disallowed_methods)] // env::var is needed for credential loading
    pub fn from_env() -> StorageResult<Option<Self>> {
        let Ok(url) = env::var("SUPABASE_URL") else {
            return Ok(None);
        };
        let Ok(key) = env::var("SUPABASE_SERVICE_ROLE_KEY").or_else(|_| env::var("SUPABASE_KEY")) else {
            return Ok(None);
        };
        if url.trim().is_empty() || key.trim().is_empty() {
            return Ok(None);
        }
        Self::new(url, key).map(Some)
    }

    fn object_url(&self, bucket: &str, path: &str) -> StorageResult<String> {
        Ok(format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, encode_path(path)?))
    }
}

async fn ensure_success(response: Response) -> StorageResult<()> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StorageError::Status { status: status.as_u16(), body });
    }
    Ok(())
}

fn encode_path(path: &str) -> StorageResult<String> {
    let segments = object_segments(path)?;
    Ok(segments
        .iter()
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    fn id(&self) -> &'static str {
        "supabase"
    }

    async fn download(&self, bucket: &str, path: &str) -> StorageResult<Bytes> {
        let url = self.object_url(bucket, path)?;
        debug!(bucket, path, "downloading object");

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound { bucket: bucket.to_string(), path: path.to_string() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status { status: status.as_u16(), body });
        }

        Ok(response.bytes().await?)
    }

    async fn upload(&self, bucket: &str, path: &str, body: Bytes, content_type: &str) -> StorageResult<()> {
        let url = self.object_url(bucket, path)?;
        debug!(bucket, path, bytes = body.len(), content_type, "uploading object");

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;

        ensure_success(response).await
    }

    /// Streams the file from disk; checkpoints are never held in memory.
    async fn upload_file(&self, bucket: &str, path: &str, local: &Path, content_type: &str) -> StorageResult<()> {
        let url = self.object_url(bucket, path)?;
        let file = tokio::fs::File::open(local).await?;
        let len = file.metadata().await?.len();
        debug!(bucket, path, bytes = len, content_type, local = %local.display(), "streaming object upload");

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, len)
            .header("x-upsert", "true")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        ensure_success(response).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> Option<String> {
        let encoded = encode_path(path).ok()?;
        Some(format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, encoded))
    }
}
