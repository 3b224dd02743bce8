use crate::error::TrainingResult;
use std::path::Path;
use tracing::info;

/// Write the request's configuration text to `path`.
///
/// The text is opaque. When `dataset_dir` is given, every occurrence of
/// `placeholder` is replaced by that directory first.
pub async fn materialize_config(
    path: &Path,
    config_text: &str,
    dataset_dir: Option<&Path>,
    placeholder: &str,
) -> TrainingResult<()> {
    let contents = match dataset_dir {
        Some(dir) if !placeholder.is_empty() && config_text.contains(placeholder) => {
            config_text.replace(placeholder, &dir.display().to_string())
        }
        _ => config_text.to_string(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;

    info!(path = %path.display(), "config file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = "job: extension\nconfig:\n  process:\n    - datasets:\n        - folder_path: \"{{DATASET_PATH}}\"\n";

    #[tokio::test]
    async fn test_writes_verbatim_without_dataset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config/run.yml");

        materialize_config(&path, CONFIG, None, "{{DATASET_PATH}}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CONFIG);
    }

    #[tokio::test]
    async fn test_replaces_placeholder_with_dataset_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.yml");
        let dataset = temp.path().join("dataset");

        materialize_config(&path, CONFIG, Some(&dataset), "{{DATASET_PATH}}").await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("{{DATASET_PATH}}"));
        assert!(written.contains(&format!("folder_path: \"{}\"", dataset.display())));
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let temp = TempDir::new().unwrap();
        // A regular file where a directory is expected.
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let result = materialize_config(&blocker.join("run.yml"), CONFIG, None, "{{DATASET_PATH}}").await;
        assert!(result.is_err());
    }
}
