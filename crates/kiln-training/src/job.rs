use crate::artifacts::UploadRecord;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TRAINING_NAME: &str = "lora_training";

/// Identifier for a training job; namespaces its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Invocation envelope as delivered by the serverless framework.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

/// Raw `input` object of an invocation. Everything is optional here;
/// `JobRequest::from_input` decides what is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub training_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub selected_images: Option<Vec<String>>,
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Per-job override of the trainer deadline.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub diagnostic: bool,
}

/// A validated training request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub config_text: String,
    pub training_name: String,
    pub user_id: Option<String>,
    pub selected_images: Vec<String>,
    pub callback_url: Option<String>,
    pub timeout_override: Option<Duration>,
}

impl JobRequest {
    pub fn from_input(job_id: JobId, input: JobInput) -> TrainingResult<Self> {
        let config_text = match input.config {
            Some(config) if !config.trim().is_empty() => config,
            _ => return Err(TrainingError::Validation("No config provided".to_string())),
        };

        let training_name = non_empty(input.training_name).unwrap_or_else(|| DEFAULT_TRAINING_NAME.to_string());
        validate_training_name(&training_name)?;

        let timeout_override = match input.timeout_seconds {
            Some(0) => {
                return Err(TrainingError::Validation("timeout_seconds must be >= 1".to_string()));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(Self {
            job_id,
            config_text,
            training_name,
            user_id: non_empty(input.user_id),
            selected_images: input
                .selected_images
                .unwrap_or_default()
                .into_iter()
                .filter(|k| !k.trim().is_empty())
                .collect(),
            callback_url: non_empty(input.callback_url),
            timeout_override,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Training names become file names, so they must stay a single path component.
pub fn validate_training_name(name: &str) -> TrainingResult<()> {
    if name.is_empty() {
        return Err(TrainingError::Validation("training_name must not be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(TrainingError::Validation(format!("invalid training_name: {name}")));
    }
    Ok(())
}

/// Lifecycle phases of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Received,
    ConfigWritten,
    DatasetFetched,
    ProcessRunning,
    Completed,
    Failed,
    TimedOut,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    Timeout,
    Error,
    Diagnostic,
}

/// Structured result returned to the invocation framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub message: String,
    /// Tail of the trainer output, newline-joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<UploadRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl JobResult {
    #[must_use]
    pub fn new(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            output: None,
            error: None,
            log_file: None,
            user_id: None,
            training_name: None,
            artifacts: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(JobStatus::Error, message)
    }

    #[must_use]
    pub fn for_request(mut self, request: &JobRequest) -> Self {
        self.user_id.clone_from(&request.user_id);
        self.training_name = Some(request.training_name.clone());
        self
    }

    #[must_use]
    pub fn with_log_file(mut self, path: Option<&Path>) -> Self {
        self.log_file = path.map(|p| p.display().to_string());
        self
    }
}
