use crate::artifacts::UploadRecord;
use crate::job::{JobId, JobPhase};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Phase { job_id: JobId, phase: JobPhase },
    Line { job_id: JobId, line: String },
    ArtifactUploaded { job_id: JobId, record: UploadRecord },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Forwards trainer output and lifecycle events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Phase { job_id, phase } => info!(%job_id, ?phase, "job phase"),
            ProgressEvent::Line { line, .. } => info!(target: "trainer", "{line}"),
            ProgressEvent::ArtifactUploaded { job_id, record } => info!(
                %job_id,
                kind = record.kind.as_str(),
                remote_path = %record.remote_path,
                "artifact uploaded"
            ),
        }
    }
}

/// Persists trainer output to a log file, flushing every line.
pub struct LogFileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LogFileSink {
    /// Create (or truncate) the log file and write its header line.
    pub fn create(path: &Path, job_id: &JobId, training_name: &str) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "# job={} training_name={} started={}",
            job_id,
            training_name,
            Utc::now().to_rfc3339()
        )?;
        writer.flush()?;

        Ok(Self { path: path.to_path_buf(), writer: Mutex::new(writer) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let Ok(mut writer) = self.writer.lock() else {
            return Ok(());
        };
        writeln!(writer, "{line}")?;
        writer.flush()
    }
}

impl ProgressSink for LogFileSink {
    fn on_event(&self, event: &ProgressEvent) {
        let result = match event {
            ProgressEvent::Line { line, .. } => self.write_line(line),
            ProgressEvent::ArtifactUploaded { record, .. } => {
                self.write_line(&format!("# uploaded {} -> {}", record.local_path.display(), record.remote_path))
            }
            ProgressEvent::Phase { .. } => Ok(()),
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to write job log");
        }
    }
}

/// Fans every event out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl MultiSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(sink);
    }
}

impl ProgressSink for MultiSink {
    fn on_event(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}
