//! Kiln Training
//!
//! Orchestrates one serverless training job:
//! - Validating the request and materializing its config file
//! - Fetching the selected dataset into a per-job workspace
//! - Supervising the external trainer process and streaming its output
//! - Uploading samples/checkpoints as the trainer reports them
//! - Mapping every outcome to a structured `JobResult`

pub mod artifacts;
pub mod config_file;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod job;
pub mod layout;
pub mod progress;
pub mod settings;
pub mod supervisor;
pub mod triggers;

pub use artifacts::{ArtifactKind, ArtifactNotification, ArtifactPatterns, ArtifactTarget, ArtifactWatcher, UploadRecord};
pub use config_file::materialize_config;
pub use dataset::{DatasetFetcher, DatasetReport, caption_key, source_path};
pub use diagnostics::{DiagnosticCheck, run_diagnostics};
pub use error::{NonFatalError, TrainingError, TrainingResult, Warnings};
pub use handler::JobHandler;
pub use job::{JobEvent, JobId, JobInput, JobPhase, JobRequest, JobResult, JobStatus};
pub use layout::JobLayout;
pub use progress::{LogFileSink, MultiSink, ProgressEvent, ProgressSink, TracingProgressSink};
pub use settings::{ArtifactSettings, CallbackSettings, DatasetSettings, JobSettings, StorageSettings, TrainerSettings};
pub use supervisor::{OutputTail, ProcessOutcome, RunningTrainer, TrainerSupervisor};
pub use triggers::{TriggerPolicy, TriggerRule};
