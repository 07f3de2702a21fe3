//! Durable storage for the job table.
//!
//! The scheduler writes its whole table on every save; a store never sees
//! partial updates. Loading never fails: a missing, unreadable or corrupt
//! snapshot reads as an empty table so the scheduler can always start.

use crate::{BatchworkError, Result, job::RuntimeJob};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::fs;
use tracing::{debug, warn};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored table with `jobs`.
    async fn save(&self, jobs: &[RuntimeJob]) -> Result<()>;

    /// The last saved table, or an empty one.
    async fn load(&self) -> Vec<RuntimeJob>;
}

/// Pretty-printed JSON array of runtime records in a single file.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, jobs: &[RuntimeJob]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(jobs)?;
        let temp = self.temp_path();
        fs::write(&temp, &data).await?;
        fs::rename(&temp, &self.path).await.map_err(|e| {
            BatchworkError::Persistence {
                message: format!("Failed to replace {}: {}", self.path.display(), e),
            }
        })?;

        debug!(path = %self.path.display(), jobs = jobs.len(), "Snapshot written");
        Ok(())
    }

    async fn load(&self) -> Vec<RuntimeJob> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read snapshot");
                return Vec::new();
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_slice(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot is not a JSON array");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value(entry) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(index, error = %e, "Skipping corrupt snapshot entry");
                    None
                }
            })
            .collect()
    }
}

/// Keeps the last saved table in memory, serialized, so loads return
/// independent copies.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    data: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, jobs: &[RuntimeJob]) -> Result<()> {
        let encoded = serde_json::to_string(jobs)?;
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(encoded);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Vec<RuntimeJob> {
        let data = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        data.and_then(|encoded| serde_json::from_str(&encoded).ok())
            .unwrap_or_default()
    }
}
