//! Worker configuration file support.
//!
//! Layered load: defaults, then an optional TOML file, then `KILN_*`
//! environment overrides.

use kiln_training::JobSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the TOML file when `--config` is not given.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Worker configuration: job settings plus process-level options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Log level used when `RUST_LOG` is unset
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(flatten)]
    pub settings: JobSettings,
}

#[derive(Debug, Error)]
pub enum WorkerConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type WorkerConfigResult<T> = std::result::Result<T, WorkerConfigError>;

impl WorkerConfig {
    /// Load from `path`, or from `KILN_CONFIG`, or fall back to defaults;
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> WorkerConfigResult<Self> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::load_from_file(&file)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> WorkerConfigResult<Self> {
        if !path.exists() {
            return Err(WorkerConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkerConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| WorkerConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Apply `KILN_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> WorkerConfigResult<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let settings = &mut self.settings;

        if let Some(v) = get("KILN_WORK_ROOT") {
            settings.work_root = PathBuf::from(v);
        }
        if let Some(v) = get("KILN_RESULTS_ROOT") {
            settings.results_root = PathBuf::from(v);
        }
        if let Some(v) = get("KILN_TRAINER_PROGRAM") {
            settings.trainer.program = v;
        }
        if let Some(v) = get("KILN_TRAINER_ROOT") {
            settings.trainer.module_root = PathBuf::from(v);
        }
        if let Some(v) = get("KILN_TRAINER_TIMEOUT_SECS") {
            settings.trainer.timeout_secs = v
                .parse()
                .map_err(|e| WorkerConfigError::InvalidValue(format!("KILN_TRAINER_TIMEOUT_SECS={v}: {e}")))?;
        }
        if let Some(v) = get("KILN_SOURCE_BUCKET") {
            settings.storage.source_bucket = v;
        }
        if let Some(v) = get("KILN_RESULTS_BUCKET") {
            settings.storage.results_bucket = v;
        }
        Ok(())
    }
}
