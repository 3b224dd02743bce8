use crate::error::TrainingResult;
use crate::job::JobId;
use crate::settings::JobSettings;
use std::path::{Path, PathBuf};

/// Filesystem layout of one job.
///
/// Scratch files live under `{work_root}/{job_id}/...`; the persisted log goes
/// to `{results_root}/logs/{training_name}_{job_id}.log`.
#[derive(Debug, Clone)]
pub struct JobLayout {
    job_dir: PathBuf,
    logs_dir: PathBuf,
    job_id: JobId,
}

impl JobLayout {
    #[must_use]
    pub fn new(settings: &JobSettings, job_id: &JobId) -> Self {
        Self {
            job_dir: settings.work_root.join(job_id.0.as_str()),
            logs_dir: settings.results_root.join("logs"),
            job_id: job_id.clone(),
        }
    }

    #[must_use]
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.job_dir.join("config")
    }

    #[must_use]
    pub fn config_path(&self, training_name: &str) -> PathBuf {
        self.config_dir().join(format!("{training_name}.yml"))
    }

    #[must_use]
    pub fn dataset_dir(&self) -> PathBuf {
        self.job_dir.join("dataset")
    }

    #[must_use]
    pub fn log_path(&self, training_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{}_{}.log", training_name, self.job_id))
    }

    pub fn ensure_job_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.job_dir)?;
        std::fs::create_dir_all(self.config_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths_are_namespaced_by_job() {
        let temp = TempDir::new().unwrap();
        let settings = JobSettings {
            work_root: temp.path().join("work"),
            results_root: temp.path().join("results"),
            ..Default::default()
        };
        let a = JobLayout::new(&settings, &JobId("job-a".to_string()));
        let b = JobLayout::new(&settings, &JobId("job-b".to_string()));

        assert_ne!(a.dataset_dir(), b.dataset_dir());
        assert_eq!(a.config_path("portrait"), temp.path().join("work/job-a/config/portrait.yml"));
        assert_eq!(a.log_path("portrait"), temp.path().join("results/logs/portrait_job-a.log"));
    }

    #[test]
    fn test_ensure_job_dirs() {
        let temp = TempDir::new().unwrap();
        let settings = JobSettings { work_root: temp.path().to_path_buf(), ..Default::default() };
        let layout = JobLayout::new(&settings, &JobId("job-1".to_string()));

        layout.ensure_job_dirs().unwrap();
        assert!(layout.config_dir().is_dir());
    }
}
