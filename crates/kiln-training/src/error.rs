use kiln_storage::{NotifyError, StorageError};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Errors that end a job early.
///
/// Trainer exit codes and deadlines are not errors: they are reported through
/// `ProcessOutcome`.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid job request: {0}")]
    Validation(String),

    #[error("failed to launch trainer: {0}")]
    Spawn(String),

    #[error("supervisor error: {0}")]
    Supervisor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures that are recorded but never change a job's terminal status.
#[derive(Debug, Error)]
pub enum NonFatalError {
    #[error("failed to fetch image {key}: {source}")]
    FetchImage {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to fetch caption {key}, using default caption: {source}")]
    FetchCaption {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("skipped image {key}: local file {local_name} collides with {other}")]
    DatasetConflict { key: String, local_name: String, other: String },

    #[error("failed to write dataset file {path}: {source}")]
    DatasetWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to upload {path}: {source}")]
    Upload {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("failed to notify callback for {file_name}: {source}")]
    Notify {
        file_name: String,
        #[source]
        source: NotifyError,
    },

    #[error("failed to scan for artifacts with {pattern}: {message}")]
    Scan { pattern: String, message: String },

    #[error("failed to write log file: {0}")]
    LogFile(std::io::Error),
}

impl NonFatalError {
    /// Short category name used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::FetchImage { .. }
            | Self::FetchCaption { .. }
            | Self::DatasetConflict { .. }
            | Self::DatasetWrite { .. } => "fetch",
            Self::Upload { .. } => "upload",
            Self::Notify { .. } => "notify",
            Self::Scan { .. } => "scan",
            Self::LogFile(_) => "log",
        }
    }
}

/// Collects non-fatal errors for one job. Every error is logged when recorded.
#[derive(Debug, Default)]
pub struct Warnings {
    errors: Vec<NonFatalError>,
}

impl Warnings {
    pub fn record(&mut self, error: NonFatalError) {
        warn!(category = error.category(), error = %error, "non-fatal job error");
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: Warnings) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NonFatalError> {
        self.errors.iter()
    }

    pub fn messages(&self) -> Vec<String> {
        self.iter().map(ToString::to_string).collect()
    }
}
