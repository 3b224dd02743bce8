//! Incremental upload of trainer artifacts.
//!
//! Uploading is the at-most-once gate: a file joins the uploaded set only
//! after its upload succeeds, whether or not the callback is delivered.
//! With a deadline set, uploads and callbacks that would outlive it are cut
//! short and the file stays pending.

use crate::error::{NonFatalError, Warnings};
use crate::triggers::TriggerPolicy;
use kiln_storage::{CallbackNotifier, NotifyError, ObjectStore, StorageError, content_type_for};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Sample,
    Checkpoint,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Directory segment in the remote result path.
    #[must_use]
    pub fn remote_dir(self) -> &'static str {
        match self {
            Self::Sample => "samples",
            Self::Checkpoint => "checkpoints",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub local_path: PathBuf,
    pub remote_path: String,
    #[serde(rename = "file_type")]
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

/// Callback body sent after each successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactNotification {
    pub user_id: Option<String>,
    pub training_name: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub url: Option<String>,
    pub file_name: String,
}

/// Glob patterns locating each artifact kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPatterns {
    pub sample: String,
    pub checkpoint: String,
}

impl ArtifactPatterns {
    #[must_use]
    pub fn for_kind(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Sample => &self.sample,
            ArtifactKind::Checkpoint => &self.checkpoint,
        }
    }
}

/// Who the artifacts of a job belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    pub user_id: Option<String>,
    pub training_name: String,
    pub callback_url: Option<String>,
}

impl ArtifactTarget {
    #[must_use]
    pub fn remote_path(&self, kind: ArtifactKind, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.user_id.as_deref().unwrap_or(ANONYMOUS_USER),
            self.training_name,
            kind.remote_dir(),
            file_name
        )
    }
}

pub struct ArtifactWatcher {
    store: Option<Arc<dyn ObjectStore>>,
    notifier: Option<Arc<dyn CallbackNotifier>>,
    bucket: String,
    target: ArtifactTarget,
    patterns: ArtifactPatterns,
    policy: TriggerPolicy,
    deadline: Option<Instant>,
    uploaded: HashSet<PathBuf>,
    records: Vec<UploadRecord>,
}

impl ArtifactWatcher {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        notifier: Option<Arc<dyn CallbackNotifier>>,
        bucket: impl Into<String>,
        target: ArtifactTarget,
        patterns: ArtifactPatterns,
    ) -> Self {
        Self {
            store,
            notifier,
            bucket: bucket.into(),
            target,
            patterns,
            policy: TriggerPolicy::default(),
            deadline: None,
            uploaded: HashSet::new(),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: TriggerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound uploads and callbacks by the trainer's deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Feed one line of trainer output; rescans whatever it triggers.
    ///
    /// Returns the records uploaded as a result of this line.
    pub async fn on_line(&mut self, line: &str, warnings: &mut Warnings) -> Vec<UploadRecord> {
        let mut uploaded = Vec::new();
        for kind in self.policy.triggered(line) {
            debug!(kind = kind.as_str(), "artifact trigger matched");
            uploaded.extend(self.scan(kind, warnings).await);
        }
        uploaded
    }

    /// Upload every not-yet-uploaded file matching the pattern for `kind`.
    pub async fn scan(&mut self, kind: ArtifactKind, warnings: &mut Warnings) -> Vec<UploadRecord> {
        let pattern = self.patterns.for_kind(kind).to_string();
        let candidates = match list_files(&pattern) {
            Ok(files) => files,
            Err(message) => {
                warnings.record(NonFatalError::Scan { pattern, message });
                return Vec::new();
            }
        };

        let mut uploaded = Vec::new();
        for path in candidates {
            if self.uploaded.contains(&path) {
                continue;
            }
            if self.deadline_passed() {
                warn!(kind = kind.as_str(), pattern = %pattern, "deadline passed, remaining artifacts left pending");
                break;
            }
            if let Some(record) = self.upload_one(kind, &path, warnings).await {
                self.uploaded.insert(path);
                self.records.push(record.clone());
                uploaded.push(record);
            }
        }
        uploaded
    }

    async fn upload_one(&self, kind: ArtifactKind, path: &Path, warnings: &mut Warnings) -> Option<UploadRecord> {
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        let remote_path = self.target.remote_path(kind, &file_name);

        let Some(store) = &self.store else {
            warnings.record(NonFatalError::Upload { path: path.to_path_buf(), source: StorageError::NotConfigured });
            return None;
        };

        let content_type = content_type_for(&file_name);
        let upload = store.upload_file(&self.bucket, &remote_path, path, &content_type);
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, upload)
                .await
                .unwrap_or_else(|_| Err(StorageError::Timeout(format!("upload of {remote_path} hit the job deadline")))),
            None => upload.await,
        };
        if let Err(source) = result {
            warnings.record(NonFatalError::Upload { path: path.to_path_buf(), source });
            return None;
        }

        let public_url = store.public_url(&self.bucket, &remote_path);
        info!(kind = kind.as_str(), local = %path.display(), remote = %remote_path, "artifact uploaded");

        if let (Some(url), Some(notifier)) = (&self.target.callback_url, &self.notifier) {
            let notification = ArtifactNotification {
                user_id: self.target.user_id.clone(),
                training_name: self.target.training_name.clone(),
                kind,
                url: public_url.clone(),
                file_name: file_name.clone(),
            };
            match serde_json::to_value(&notification) {
                Ok(payload) => {
                    let notify = notifier.notify(url, &payload);
                    let result = match self.deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, notify)
                            .await
                            .unwrap_or_else(|_| Err(NotifyError::Request("callback hit the job deadline".to_string()))),
                        None => notify.await,
                    };
                    if let Err(source) = result {
                        warnings.record(NonFatalError::Notify { file_name, source });
                    }
                }
                Err(e) => debug!(error = %e, "failed to encode callback payload"),
            }
        }

        Some(UploadRecord { local_path: path.to_path_buf(), remote_path, kind, public_url })
    }

    #[must_use]
    pub fn is_uploaded(&self, path: &Path) -> bool {
        self.uploaded.contains(path)
    }

    #[must_use]
    pub fn into_records(self) -> Vec<UploadRecord> {
        self.records
    }
}

fn list_files(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let paths = glob::glob(pattern).map_err(|e| e.to_string())?;
    let mut files: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}
