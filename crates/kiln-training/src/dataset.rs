//! Pulls selected training images and their captions into the job workspace.
//!
//! Image failures are recorded and the key is skipped; caption failures fall
//! back to a default caption. Neither ends the job.

use crate::error::{NonFatalError, TrainingResult, Warnings};
use crate::settings::DatasetSettings;
use futures::stream::{self, StreamExt};
use kiln_storage::{ObjectStore, StorageError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of fetching one job's dataset.
#[derive(Debug, Default)]
pub struct DatasetReport {
    pub dir: PathBuf,
    /// One `(image, caption)` pair per key that was fetched.
    pub pairs: Vec<(PathBuf, PathBuf)>,
    /// Captions synthesized from the default text.
    pub default_captions: usize,
    pub warnings: Warnings,
}

#[derive(Clone)]
pub struct DatasetFetcher {
    store: Option<Arc<dyn ObjectStore>>,
    bucket: String,
    settings: DatasetSettings,
}

struct PlannedKey<'a> {
    key: &'a str,
    image_name: &'a str,
    caption_name: String,
}

enum KeyOutcome {
    Fetched { image: PathBuf, caption: PathBuf, default_caption: bool, warning: Option<NonFatalError> },
    Skipped(NonFatalError),
}

impl DatasetFetcher {
    #[must_use]
    pub fn new(store: Option<Arc<dyn ObjectStore>>, bucket: impl Into<String>, settings: DatasetSettings) -> Self {
        Self { store, bucket: bucket.into(), settings }
    }

    /// Fetch every key into `dataset_dir`.
    ///
    /// Only failing to create the directory itself is fatal.
    pub async fn fetch(&self, user_id: Option<&str>, keys: &[String], dataset_dir: &Path) -> TrainingResult<DatasetReport> {
        tokio::fs::create_dir_all(dataset_dir).await?;

        let mut report = DatasetReport { dir: dataset_dir.to_path_buf(), ..Default::default() };
        let planned = self.plan(keys, &mut report.warnings);

        let fetches: Vec<_> = planned.into_iter().map(|item| self.fetch_key(user_id, item, dataset_dir)).collect();
        let outcomes: Vec<KeyOutcome> = stream::iter(fetches)
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                KeyOutcome::Fetched { image, caption, default_caption, warning } => {
                    if default_caption {
                        report.default_captions += 1;
                    }
                    if let Some(warning) = warning {
                        report.warnings.record(warning);
                    }
                    report.pairs.push((image, caption));
                }
                KeyOutcome::Skipped(error) => report.warnings.record(error),
            }
        }
        report.pairs.sort();

        info!(
            dir = %dataset_dir.display(),
            requested = keys.len(),
            fetched = report.pairs.len(),
            default_captions = report.default_captions,
            warnings = report.warnings.len(),
            "dataset fetched"
        );
        Ok(report)
    }

    /// Assign local file names to keys. Exact duplicates are dropped; a key
    /// whose image or caption name is already taken is skipped, first key wins.
    fn plan<'a>(&self, keys: &'a [String], warnings: &mut Warnings) -> Vec<PlannedKey<'a>> {
        let mut seen = HashSet::new();
        let mut claimed: HashMap<String, &'a str> = HashMap::new();
        let mut planned = Vec::new();

        for key in keys {
            if !seen.insert(key.as_str()) {
                debug!(key, "duplicate dataset key ignored");
                continue;
            }
            let Some(image_name) = file_name_of(key) else {
                warnings.record(NonFatalError::FetchImage {
                    key: key.clone(),
                    source: StorageError::InvalidPath(key.clone()),
                });
                continue;
            };
            let caption_name = caption_key(image_name, &self.settings.caption_extension);

            let conflict = if caption_name == image_name {
                Some((caption_name.clone(), "its own caption".to_string()))
            } else {
                [image_name, caption_name.as_str()]
                    .into_iter()
                    .find_map(|name| claimed.get(name).map(|owner| (name.to_string(), format!("key {owner}"))))
            };
            if let Some((local_name, other)) = conflict {
                warnings.record(NonFatalError::DatasetConflict { key: key.clone(), local_name, other });
                continue;
            }

            claimed.insert(image_name.to_string(), key);
            claimed.insert(caption_name.clone(), key);
            planned.push(PlannedKey { key, image_name, caption_name });
        }
        planned
    }

    async fn fetch_key(&self, user_id: Option<&str>, item: PlannedKey<'_>, dataset_dir: &Path) -> KeyOutcome {
        let PlannedKey { key, image_name, caption_name } = item;
        let image_path = dataset_dir.join(image_name);
        let caption_path = dataset_dir.join(caption_name);

        let image = match self.download(&source_path(user_id, key)).await {
            Ok(bytes) => bytes,
            Err(source) => return KeyOutcome::Skipped(NonFatalError::FetchImage { key: key.to_string(), source }),
        };
        if let Err(source) = tokio::fs::write(&image_path, &image).await {
            return KeyOutcome::Skipped(NonFatalError::DatasetWrite { path: image_path, source });
        }

        let caption_source = source_path(user_id, &caption_key(key, &self.settings.caption_extension));
        let (caption, warning) = match self.download(&caption_source).await {
            Ok(bytes) => (bytes.to_vec(), None),
            Err(source) => {
                let warning = NonFatalError::FetchCaption { key: caption_source.clone(), source };
                (format!("{}\n", self.settings.default_caption).into_bytes(), Some(warning))
            }
        };
        let default_caption = warning.is_some();

        if let Err(source) = tokio::fs::write(&caption_path, &caption).await {
            return KeyOutcome::Skipped(NonFatalError::DatasetWrite { path: caption_path, source });
        }

        debug!(key, image = %image_path.display(), default_caption, "dataset item fetched");
        KeyOutcome::Fetched { image: image_path, caption: caption_path, default_caption, warning }
    }

    async fn download(&self, path: &str) -> Result<bytes::Bytes, StorageError> {
        match &self.store {
            Some(store) => store.download(&self.bucket, path).await,
            None => Err(StorageError::NotConfigured),
        }
    }
}

/// Remote path of a source object: keys are scoped by user when one is known.
#[must_use]
pub fn source_path(user_id: Option<&str>, key: &str) -> String {
    let key = key.trim_start_matches('/');
    match user_id {
        Some(user) => format!("{user}/{key}"),
        None => key.to_string(),
    }
}

/// Swap the final extension of `key` for `extension` (or append it).
#[must_use]
pub fn caption_key(key: &str, extension: &str) -> String {
    let name_start = key.rfind('/').map_or(0, |i| i + 1);
    let stem_end = match key[name_start..].rfind('.') {
        Some(dot) if dot > 0 => name_start + dot,
        _ => key.len(),
    };
    format!("{}.{}", &key[..stem_end], extension)
}

fn file_name_of(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next()?;
    (!name.is_empty() && name != "." && name != "..").then_some(name)
}
