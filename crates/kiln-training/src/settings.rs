//! Worker-level settings shared by every job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Token in artifact glob templates replaced by the job's training name.
pub const TRAINING_NAME_TOKEN: &str = "{training_name}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Per-job workspaces live under `{work_root}/{job_id}`.
    pub work_root: PathBuf,
    /// Persisted logs are written to `{results_root}/logs`.
    pub results_root: PathBuf,
    pub trainer: TrainerSettings,
    pub dataset: DatasetSettings,
    pub artifacts: ArtifactSettings,
    pub storage: StorageSettings,
    pub callback: CallbackSettings,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/tmp/kiln"),
            results_root: PathBuf::from("/workspace/results"),
            trainer: TrainerSettings::default(),
            dataset: DatasetSettings::default(),
            artifacts: ArtifactSettings::default(),
            storage: StorageSettings::default(),
            callback: CallbackSettings::default(),
        }
    }
}

/// How the external trainer is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub program: String,
    /// Arguments placed before the config path, which is always last.
    pub args: Vec<String>,
    /// Environment variable naming the trainer's module search root.
    pub module_path_var: String,
    pub module_root: PathBuf,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Wall-clock deadline in seconds; `0` disables it.
    pub timeout_secs: u64,
    /// Number of trailing output lines kept for the result.
    pub tail_lines: usize,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["/app/run.py".to_string()],
            module_path_var: "PYTHONPATH".to_string(),
            module_root: PathBuf::from("/app"),
            env: BTreeMap::new(),
            working_dir: None,
            timeout_secs: 7200,
            tail_lines: 50,
        }
    }
}

impl TrainerSettings {
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// Replaced in the config text by the job's dataset directory.
    pub placeholder: String,
    /// Written when a caption object cannot be fetched.
    pub default_caption: String,
    pub caption_extension: String,
    /// Maximum number of images fetched at once.
    pub concurrency: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            placeholder: "{{DATASET_PATH}}".to_string(),
            default_caption: "a photo".to_string(),
            caption_extension: "txt".to_string(),
            concurrency: 4,
        }
    }
}

/// Where the trainer writes samples and checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub sample_glob: String,
    pub checkpoint_glob: String,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            sample_glob: "/app/output/{training_name}/samples/*".to_string(),
            checkpoint_glob: "/app/output/{training_name}/*.safetensors".to_string(),
        }
    }
}

impl ArtifactSettings {
    /// The training name is matched literally, never as glob syntax.
    #[must_use]
    pub fn sample_pattern(&self, training_name: &str) -> String {
        expand(&self.sample_glob, training_name)
    }

    #[must_use]
    pub fn checkpoint_pattern(&self, training_name: &str) -> String {
        expand(&self.checkpoint_glob, training_name)
    }
}

fn expand(template: &str, training_name: &str) -> String {
    template.replace(TRAINING_NAME_TOKEN, &glob::Pattern::escape(training_name))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Bucket holding source images and captions.
    pub source_bucket: String,
    /// Bucket receiving samples and checkpoints.
    pub results_bucket: String,
    /// Root of a filesystem object store, used when no cloud backend is configured.
    pub local_root: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            source_bucket: "training-images".to_string(),
            results_bucket: "training-results".to_string(),
            local_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    pub timeout_secs: u64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl CallbackSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}
