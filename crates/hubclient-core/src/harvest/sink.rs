use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One aggregated harvest, as handed to a [`StorageSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestBatch<T> {
    pub category: String,
    pub account: String,
    pub records: Vec<T>,
    pub harvested_at: DateTime<Utc>,
}

impl<T> HarvestBatch<T> {
    pub fn new(category: impl Into<String>, account: impl Into<String>, records: Vec<T>) -> Self {
        Self {
            category: category.into(),
            account: account.into(),
            records,
            harvested_at: Utc::now(),
        }
    }
}

/// Destination for harvested batches.
///
/// A sink reports failure but is never retried by the pipeline.
#[async_trait]
pub trait StorageSink<T: Send + Sync>: Send + Sync {
    async fn persist(&self, batch: &HarvestBatch<T>) -> Result<()>;
}

// ============================================================================
// JSON file sink
// ============================================================================

/// Batches kept per category unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 10;

/// Writes each batch to `<dir>/<category>_<account>_<timestamp>.json` and
/// keeps only the newest batches of each category.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
    keep_last: usize,
}

/// Fields needed to order stored batches without decoding their records.
#[derive(Deserialize)]
struct BatchHeader {
    category: String,
    harvested_at: DateTime<Utc>,
}

/// Keep file names portable whatever the account id looks like.
fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Batch files whose name matches `category`. Distinct categories may
/// sanitize to the same prefix, so callers still check the stored category.
fn category_files(dir: &Path, category: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}_", file_component(category));
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::Storage(format!("Failed to list {}: {}", dir.display(), e)))?;

    Ok(entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".json"))
        })
        .collect())
}

/// Delete all but the newest `keep_last` batches of `category`. Returns
/// the number of files removed.
fn prune(dir: &Path, category: &str, keep_last: usize) -> Result<usize> {
    let mut stored: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
    for path in category_files(dir, category)? {
        let header = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<BatchHeader>(&raw).map_err(|e| e.to_string()));
        match header {
            Ok(header) if header.category == category => stored.push((header.harvested_at, path)),
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable batch file"),
        }
    }

    if stored.len() <= keep_last {
        return Ok(0);
    }
    stored.sort_by_key(|(at, _)| *at);
    let excess = stored.len() - keep_last;
    for (_, path) in stored.iter().take(excess) {
        std::fs::remove_file(path)
            .map_err(|e| Error::Storage(format!("Failed to remove {}: {}", path.display(), e)))?;
    }
    Ok(excess)
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            keep_last: DEFAULT_RETENTION,
        })
    }

    /// Keep only the newest `keep_last` batches of each category. The batch
    /// just written always survives.
    pub fn with_retention(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last.max(1);
        self
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn batch_path<T>(&self, batch: &HarvestBatch<T>) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            file_component(&batch.category),
            file_component(&batch.account),
            batch.harvested_at.format("%Y%m%dT%H%M%S%6fZ")
        ))
    }

    /// Every stored batch of `category`, oldest first. Unreadable files are
    /// skipped with a warning.
    pub fn load_batches<T: DeserializeOwned>(&self, category: &str) -> Result<Vec<HarvestBatch<T>>> {
        let mut batches = Vec::new();
        for path in category_files(&self.dir, category)? {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<HarvestBatch<T>>(&raw).map_err(|e| e.to_string()));
            match parsed {
                Ok(batch) if batch.category == category => batches.push(batch),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable batch file"),
            }
        }

        batches.sort_by_key(|b| b.harvested_at);
        Ok(batches)
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync> StorageSink<T> for JsonFileSink {
    async fn persist(&self, batch: &HarvestBatch<T>) -> Result<()> {
        let path = self.batch_path(batch);
        let contents = serde_json::to_string_pretty(batch)
            .map_err(|e| Error::Storage(format!("Failed to encode batch: {}", e)))?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || std::fs::write(&target, contents))
            .await
            .map_err(|e| Error::Storage(format!("Batch writer stopped: {}", e)))?
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), records = batch.records.len(), "Batch written");

        // A failed prune does not fail the write
        let dir = self.dir.clone();
        let category = batch.category.clone();
        let keep_last = self.keep_last;
        let pruned = tokio::task::spawn_blocking(move || prune(&dir, &category, keep_last))
            .await
            .map_err(|e| Error::Storage(format!("Batch pruner stopped: {}", e)));
        match pruned.and_then(|r| r) {
            Ok(0) => {}
            Ok(removed) => info!(category = %batch.category, removed, keep_last, "Pruned old batches"),
            Err(e) => warn!(category = %batch.category, error = %e, "Failed to prune old batches"),
        }
        Ok(())
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Keeps batches in memory. Useful for embedding and tests.
#[derive(Debug)]
pub struct MemorySink<T> {
    batches: Mutex<Vec<HarvestBatch<T>>>,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<HarvestBatch<T>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> StorageSink<T> for MemorySink<T> {
    async fn persist(&self, batch: &HarvestBatch<T>) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        Ok(())
    }
}
