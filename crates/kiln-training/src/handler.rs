//! One invocation, start to finish.
//!
//! `JobHandler::handle` always returns a `JobResult`; errors from any stage
//! become an `error` result instead of escaping to the caller.

use crate::artifacts::{ArtifactPatterns, ArtifactTarget, ArtifactWatcher};
use crate::config_file::materialize_config;
use crate::dataset::DatasetFetcher;
use crate::diagnostics::{DiagnosticCheck, run_diagnostics};
use crate::error::{NonFatalError, TrainingError, TrainingResult, Warnings};
use crate::job::{JobEvent, JobId, JobPhase, JobRequest, JobResult, JobStatus, validate_training_name};
use crate::layout::JobLayout;
use crate::progress::{LogFileSink, MultiSink, ProgressEvent, ProgressSink, TracingProgressSink};
use crate::settings::JobSettings;
use crate::supervisor::{ProcessOutcome, TrainerSupervisor};
use kiln_storage::{CallbackNotifier, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub struct JobHandler {
    settings: JobSettings,
    store: Option<Arc<dyn ObjectStore>>,
    notifier: Option<Arc<dyn CallbackNotifier>>,
}

impl JobHandler {
    #[must_use]
    pub fn new(settings: JobSettings) -> Self {
        Self { settings, store: None, notifier: None }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn CallbackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Handle a raw invocation payload (`{"id": ..., "input": {...}}`).
    pub async fn handle(&self, payload: &serde_json::Value) -> JobResult {
        match serde_json::from_value::<JobEvent>(payload.clone()) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                warn!(error = %e, "rejected malformed job payload");
                JobResult::error(format!("invalid job payload: {e}"))
            }
        }
    }

    pub async fn handle_event(&self, event: JobEvent) -> JobResult {
        if event.input.diagnostic {
            return self.diagnose();
        }

        let job_id = event
            .id
            .filter(|id| validate_training_name(id).is_ok())
            .map_or_else(JobId::new, JobId);

        let request = match JobRequest::from_input(job_id, event.input) {
            Ok(request) => request,
            Err(TrainingError::Validation(message)) => {
                warn!(%message, "rejected job request");
                return JobResult::error(message);
            }
            Err(e) => return JobResult::error(e.to_string()),
        };

        let span = info_span!("job", job_id = %request.job_id, training_name = %request.training_name);
        let mut log_file = None;
        match self.run(&request, &mut log_file).instrument(span).await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %request.job_id, error = %e, "training job errored");
                JobResult::error(e.to_string()).for_request(&request).with_log_file(log_file.as_deref())
            }
        }
    }

    /// Report environment checks without launching anything.
    pub fn diagnose(&self) -> JobResult {
        let checks = run_diagnostics(&self.settings, self.store.as_ref().map(|s| s.id()));
        let failed = checks.iter().filter(|c| !c.ok).count();
        let message = if failed == 0 {
            "Environment checks passed".to_string()
        } else {
            format!("{failed} environment check(s) failed")
        };

        let mut result = JobResult::new(JobStatus::Diagnostic, message);
        result.output = Some(checks.iter().map(DiagnosticCheck::render).collect::<Vec<_>>().join("\n"));
        result
    }

    async fn run(&self, request: &JobRequest, log_file: &mut Option<PathBuf>) -> TrainingResult<JobResult> {
        let job_id = &request.job_id;
        let layout = JobLayout::new(&self.settings, job_id);
        let mut sinks = MultiSink::new();
        sinks.push(Box::new(TracingProgressSink));
        let mut warnings = Warnings::default();

        emit_phase(&sinks, job_id, JobPhase::Received);
        info!(
            user_id = request.user_id.as_deref(),
            images = request.selected_images.len(),
            callback = request.callback_url.is_some(),
            "training job received"
        );

        layout.ensure_job_dirs()?;
        debug!(job_dir = %layout.job_dir().display(), "job workspace ready");
        let wants_dataset = !request.selected_images.is_empty();
        let dataset_dir = layout.dataset_dir();
        let config_path = layout.config_path(&request.training_name);
        materialize_config(
            &config_path,
            &request.config_text,
            wants_dataset.then_some(dataset_dir.as_path()),
            &self.settings.dataset.placeholder,
        )
        .await?;
        emit_phase(&sinks, job_id, JobPhase::ConfigWritten);

        if wants_dataset {
            let fetcher = DatasetFetcher::new(
                self.store.clone(),
                self.settings.storage.source_bucket.clone(),
                self.settings.dataset.clone(),
            );
            let report = fetcher
                .fetch(request.user_id.as_deref(), &request.selected_images, &dataset_dir)
                .await?;
            warnings.extend(report.warnings);
            emit_phase(&sinks, job_id, JobPhase::DatasetFetched);
        }

        let log_path = layout.log_path(&request.training_name);
        match LogFileSink::create(&log_path, job_id, &request.training_name) {
            Ok(sink) => {
                *log_file = Some(sink.path().to_path_buf());
                sinks.push(Box::new(sink));
            }
            Err(e) => warnings.record(NonFatalError::LogFile(e)),
        }

        let supervisor = TrainerSupervisor::new(self.settings.trainer.clone());
        let mut running = supervisor.spawn(&config_path, request.timeout_override)?;
        let mut watcher = ArtifactWatcher::new(
            self.store.clone(),
            self.notifier.clone(),
            self.settings.storage.results_bucket.clone(),
            ArtifactTarget {
                user_id: request.user_id.clone(),
                training_name: request.training_name.clone(),
                callback_url: request.callback_url.clone(),
            },
            ArtifactPatterns {
                sample: self.settings.artifacts.sample_pattern(&request.training_name),
                checkpoint: self.settings.artifacts.checkpoint_pattern(&request.training_name),
            },
        )
        .with_deadline(running.deadline());
        emit_phase(&sinks, job_id, JobPhase::ProcessRunning);

        while let Some(line) = running.next_line().await {
            sinks.on_event(&ProgressEvent::Line { job_id: job_id.clone(), line: line.clone() });
            for record in watcher.on_line(&line, &mut warnings).await {
                sinks.on_event(&ProgressEvent::ArtifactUploaded { job_id: job_id.clone(), record });
            }
        }

        let outcome = running.finish().await?;
        let (phase, mut result) = match &outcome {
            ProcessOutcome::Success { .. } => {
                (JobPhase::Completed, JobResult::new(JobStatus::Completed, "Training completed successfully"))
            }
            ProcessOutcome::Failure { code, .. } => {
                let mut result = JobResult::new(JobStatus::Failed, "Training failed");
                result.error = Some(format!("trainer exited with code {code}"));
                (JobPhase::Failed, result)
            }
            ProcessOutcome::TimedOut { after, .. } => {
                let mut result =
                    JobResult::new(JobStatus::Timeout, format!("Training timed out after {} seconds", after.as_secs()));
                result.error = Some("trainer exceeded its deadline and was terminated".to_string());
                (JobPhase::TimedOut, result)
            }
        };
        emit_phase(&sinks, job_id, phase);

        result.output = Some(outcome.tail().join("\n"));
        result.artifacts = watcher.into_records();
        result.warnings = warnings.messages();
        info!(
            status = ?result.status,
            artifacts = result.artifacts.len(),
            warnings = result.warnings.len(),
            "training job finished"
        );
        Ok(result.for_request(request).with_log_file(log_file.as_deref()))
    }
}

fn emit_phase(sinks: &MultiSink, job_id: &JobId, phase: JobPhase) {
    sinks.on_event(&ProgressEvent::Phase { job_id: job_id.clone(), phase });
}
