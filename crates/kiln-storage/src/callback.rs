use crate::error::NotifyError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Delivers JSON notifications to caller-supplied endpoints.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn notify(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError>;
}

/// `CallbackNotifier` that POSTs the payload with a short timeout.
#[derive(Debug, Clone)]
pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        debug!(url, "sending callback");
        let response = self.client.post(url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}
