use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by an `ObjectStore`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Request(String),

    #[error("object not found: {bucket}/{path}")]
    NotFound { bucket: String, path: String },

    #[error("storage returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("storage request timed out: {0}")]
    Timeout(String),

    #[error("storage is not configured")]
    NotConfigured,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Errors raised while delivering a callback.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("callback request failed: {0}")]
    Request(String),

    #[error("callback endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}
