//! End-to-end tests for `JobHandler` using `sh` scripts as stand-in trainers.

#![cfg(unix)]

use async_trait::async_trait;
use bytes::Bytes;
use kiln_storage::{CallbackNotifier, LocalObjectStore, NotifyError, ObjectStore, StorageError, StorageResult};
use kiln_training::{JobHandler, JobId, JobLayout, JobSettings, JobStatus};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn settings_for(temp: &TempDir, script: &str) -> JobSettings {
    let mut settings = JobSettings {
        work_root: temp.path().join("work"),
        results_root: temp.path().join("results"),
        ..Default::default()
    };
    settings.trainer.program = "sh".to_string();
    settings.trainer.args = vec!["-c".to_string(), script.to_string(), "trainer".to_string()];
    settings.trainer.module_root = temp.path().to_path_buf();
    settings.trainer.timeout_secs = 60;
    settings.artifacts.sample_glob = format!("{}/output/{{training_name}}/samples/*", temp.path().display());
    settings.artifacts.checkpoint_glob = format!("{}/output/{{training_name}}/*.safetensors", temp.path().display());
    settings
}

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    fail: bool,
}

#[async_trait]
impl CallbackNotifier for RecordingNotifier {
    async fn notify(&self, url: &str, payload: &serde_json::Value) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push((url.to_string(), payload.clone()));
        if self.fail {
            return Err(NotifyError::Status { status: 503, body: "unavailable".to_string() });
        }
        Ok(())
    }
}

/// Fails the first `failures` uploads of either kind, then delegates.
struct FlakyStore {
    inner: LocalObjectStore,
    failures: AtomicUsize,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn id(&self) -> &'static str {
        "flaky"
    }

    async fn download(&self, bucket: &str, path: &str) -> StorageResult<Bytes> {
        self.inner.download(bucket, path).await
    }

    async fn upload(&self, bucket: &str, path: &str, body: Bytes, content_type: &str) -> StorageResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Status { status: 500, body: "try again".to_string() });
        }
        self.inner.upload(bucket, path, body, content_type).await
    }

    async fn upload_file(&self, bucket: &str, path: &str, local: &Path, content_type: &str) -> StorageResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Status { status: 500, body: "try again".to_string() });
        }
        self.inner.upload_file(bucket, path, local, content_type).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> Option<String> {
        self.inner.public_url(bucket, path)
    }
}

fn put(store: &LocalObjectStore, bucket: &str, path: &str, body: &[u8]) {
    let file = store.object_path(bucket, path).unwrap();
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(file, body).unwrap();
}

#[tokio::test]
async fn test_missing_config_has_no_side_effects() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("launched");
    let settings = settings_for(&temp, &format!("touch {}", marker.display()));
    let handler = JobHandler::new(settings);

    let result = handler.handle(&json!({"input": {"training_name": "portrait"}})).await;

    assert_eq!(result.status, JobStatus::Error);
    assert_eq!(result.message, "No config provided");
    assert!(!temp.path().join("work").exists());
    assert!(!temp.path().join("results").exists());
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_malformed_payload_is_error_result() {
    let temp = TempDir::new().unwrap();
    let handler = JobHandler::new(settings_for(&temp, "exit 0"));

    let result = handler.handle(&json!({"input": {"selected_images": "not-a-list"}})).await;
    assert_eq!(result.status, JobStatus::Error);
    assert!(result.message.starts_with("invalid job payload"));
}

#[tokio::test]
async fn test_completed_run_keeps_last_fifty_lines() {
    let temp = TempDir::new().unwrap();
    let script = r#"i=1; while [ $i -le 80 ]; do echo "line $i"; i=$((i+1)); done"#;
    let handler = JobHandler::new(settings_for(&temp, script));

    let result = handler
        .handle(&json!({"id": "job-tail", "input": {"config": "job: extension", "training_name": "tail"}}))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.message, "Training completed successfully");
    assert_eq!(result.training_name.as_deref(), Some("tail"));

    let output = result.output.unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 50);
    assert_eq!(lines.first(), Some(&"line 31"));
    assert_eq!(lines.last(), Some(&"line 80"));

    let log_file = result.log_file.unwrap();
    assert!(log_file.ends_with("tail_job-tail.log"));
    let log = std::fs::read_to_string(log_file).unwrap();
    assert!(log.starts_with("# job=job-tail training_name=tail"));
    assert!(log.contains("line 1\n"));
    assert!(log.contains("line 80\n"));
}

#[tokio::test]
async fn test_config_is_passed_as_last_argument() {
    let temp = TempDir::new().unwrap();
    let handler = JobHandler::new(settings_for(&temp, r#"cat "$1""#));

    let result = handler
        .handle(&json!({"id": "job-cfg", "input": {"config": "job: extension\nsteps: 10", "training_name": "cfg"}}))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("job: extension\nsteps: 10"));

    let settings = handler.settings();
    let layout = JobLayout::new(settings, &JobId("job-cfg".to_string()));
    assert!(layout.config_path("cfg").is_file());
}

#[tokio::test]
async fn test_nonzero_exit_is_failed() {
    let temp = TempDir::new().unwrap();
    let handler = JobHandler::new(settings_for(&temp, "echo boom >&2; exit 2"));

    let result = handler.handle(&json!({"input": {"config": "job: extension"}})).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.message, "Training failed");
    assert!(result.error.unwrap().contains("code 2"));
    assert_eq!(result.output.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_unlaunchable_trainer_is_error() {
    let temp = TempDir::new().unwrap();
    let mut settings = settings_for(&temp, "exit 0");
    settings.trainer.program = temp.path().join("missing-trainer").display().to_string();
    let handler = JobHandler::new(settings);

    let result = handler
        .handle(&json!({"input": {"config": "job: extension", "user_id": "user-1"}}))
        .await;

    assert_eq!(result.status, JobStatus::Error);
    assert_eq!(result.user_id.as_deref(), Some("user-1"));
    assert_eq!(result.training_name.as_deref(), Some("lora_training"));
}

#[tokio::test]
async fn test_deadline_terminates_trainer() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("trainer.pid");
    let script = format!("echo $$ > {}; echo started; exec sleep 30", pid_file.display());
    let handler = JobHandler::new(settings_for(&temp, &script));

    let started = std::time::Instant::now();
    let result = handler
        .handle(&json!({"input": {"config": "job: extension", "timeout_seconds": 1}}))
        .await;

    assert_eq!(result.status, JobStatus::Timeout);
    assert!(result.message.contains("timed out"));
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert!(result.output.unwrap().contains("started"));

    #[cfg(target_os = "linux")]
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    #[cfg(target_os = "linux")]
    assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
}

#[tokio::test]
async fn test_trainer_exit_completes_job_despite_background_child() {
    let temp = TempDir::new().unwrap();
    let handler = JobHandler::new(settings_for(&temp, "sleep 6 & echo trained; exit 0"));

    let started = std::time::Instant::now();
    let result = handler.handle(&json!({"input": {"config": "job: extension"}})).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("trained"));
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn test_training_name_is_not_glob_syntax() {
    let temp = TempDir::new().unwrap();
    let foreign = temp.path().join("output/other_run");
    std::fs::create_dir_all(&foreign).unwrap();
    std::fs::write(foreign.join("secret.safetensors"), b"not yours").unwrap();

    let store = LocalObjectStore::new(temp.path().join("store"));
    let handler = JobHandler::new(settings_for(&temp, "echo 'checkpoint saved'")).with_store(Arc::new(store.clone()));
    let result = handler
        .handle(&json!({"input": {"config": "job: extension", "training_name": "*", "user_id": "user-1"}}))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.artifacts.is_empty());
    assert!(result.warnings.is_empty());
    assert!(!store.root().join("training-results").exists());
}

#[tokio::test]
async fn test_dataset_pairs_with_default_caption() {
    let temp = TempDir::new().unwrap();
    let store = LocalObjectStore::new(temp.path().join("store"));
    put(&store, "training-images", "user-1/a.png", b"png-bytes");
    put(&store, "training-images", "user-1/a.txt", b"a cat on a sofa");
    put(&store, "training-images", "user-1/b.jpg", b"jpg-bytes");

    let handler = JobHandler::new(settings_for(&temp, r#"cat "$1""#)).with_store(Arc::new(store));
    let result = handler
        .handle(&json!({
            "id": "job-data",
            "input": {
                "config": "folder_path: {{DATASET_PATH}}",
                "user_id": "user-1",
                "selected_images": ["a.png", "b.jpg", "missing.png"]
            }
        }))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    let layout = JobLayout::new(handler.settings(), &JobId("job-data".to_string()));
    let dataset = layout.dataset_dir();

    assert_eq!(result.output.unwrap(), format!("folder_path: {}", dataset.display()));
    assert_eq!(std::fs::read(dataset.join("a.png")).unwrap(), b"png-bytes");
    assert_eq!(std::fs::read_to_string(dataset.join("a.txt")).unwrap(), "a cat on a sofa");
    assert_eq!(std::fs::read(dataset.join("b.jpg")).unwrap(), b"jpg-bytes");
    assert_eq!(std::fs::read_to_string(dataset.join("b.txt")).unwrap(), "a photo\n");
    assert!(!dataset.join("missing.png").exists());
    assert!(!dataset.join("missing.txt").exists());

    assert_eq!(result.warnings.len(), 2);
}

#[tokio::test]
async fn test_placeholder_kept_without_images() {
    let temp = TempDir::new().unwrap();
    let handler = JobHandler::new(settings_for(&temp, r#"cat "$1""#));

    let result = handler
        .handle(&json!({"input": {"config": "folder_path: {{DATASET_PATH}}", "selected_images": []}}))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("folder_path: {{DATASET_PATH}}"));
}

#[tokio::test]
async fn test_checkpoint_uploaded_once_with_callback() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("output/run");
    let script = format!(
        "mkdir -p {out}/samples; printf weights > {out}/run_000100.safetensors; \
         echo 'Checkpoint saved'; echo 'checkpoint saved again'; \
         printf img > {out}/samples/s1.png; echo 'Saved sample images'",
        out = out.display()
    );

    let store = LocalObjectStore::new(temp.path().join("store"));
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = JobHandler::new(settings_for(&temp, &script))
        .with_store(Arc::new(store.clone()))
        .with_notifier(notifier.clone());

    let result = handler
        .handle(&json!({
            "input": {
                "config": "job: extension",
                "training_name": "run",
                "user_id": "user-1",
                "callback_url": "https://example.test/hook"
            }
        }))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.artifacts.len(), 2);
    assert!(result.warnings.is_empty());

    let checkpoint = store
        .object_path("training-results", "user-1/run/checkpoints/run_000100.safetensors")
        .unwrap();
    assert_eq!(std::fs::read(checkpoint).unwrap(), b"weights");
    let sample = store.object_path("training-results", "user-1/run/samples/s1.png").unwrap();
    assert_eq!(std::fs::read(sample).unwrap(), b"img");

    let calls = notifier.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "https://example.test/hook");
    assert_eq!(calls[0].1["type"], "checkpoint");
    assert_eq!(calls[0].1["file_name"], "run_000100.safetensors");
    assert_eq!(calls[0].1["training_name"], "run");
    assert_eq!(calls[1].1["type"], "sample");
}

#[tokio::test]
async fn test_failed_upload_is_retried_on_next_trigger() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("output/retry");
    let script = format!(
        "mkdir -p {out}; printf w > {out}/retry.safetensors; echo 'checkpoint saved'; echo 'checkpoint saved'",
        out = out.display()
    );

    let local = LocalObjectStore::new(temp.path().join("store"));
    let store = Arc::new(FlakyStore { inner: local.clone(), failures: AtomicUsize::new(1) });
    let notifier = Arc::new(RecordingNotifier { fail: true, ..Default::default() });
    let handler = JobHandler::new(settings_for(&temp, &script))
        .with_store(store)
        .with_notifier(notifier.clone());

    let result = handler
        .handle(&json!({
            "input": {
                "config": "job: extension",
                "training_name": "retry",
                "callback_url": "https://example.test/hook"
            }
        }))
        .await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].remote_path, "anonymous/retry/checkpoints/retry.safetensors");
    // one failed upload, one undelivered callback
    assert_eq!(result.warnings.len(), 2);
    assert_eq!(notifier.calls.lock().unwrap().len(), 1);
    assert!(
        local
            .object_path("training-results", "anonymous/retry/checkpoints/retry.safetensors")
            .unwrap()
            .is_file()
    );
}

#[tokio::test]
async fn test_diagnostic_skips_training() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("launched");
    let handler = JobHandler::new(settings_for(&temp, &format!("touch {}", marker.display())));

    let result = handler.handle(&json!({"input": {"diagnostic": true}})).await;

    assert_eq!(result.status, JobStatus::Diagnostic);
    let output = result.output.unwrap();
    assert!(output.contains("trainer_program"));
    assert!(output.contains("[FAIL] storage"));
    assert!(!marker.exists());
}
