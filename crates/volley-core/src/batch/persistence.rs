//! Optional sink for terminal batch results.

use crate::batch::types::BatchResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while persisting a result.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The result could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives every batch result once it reaches a terminal state.
///
/// Called fire-and-forget by the manager. Errors are logged and never change
/// the batch outcome.
#[async_trait]
pub trait ResultPersister: Send + Sync {
    /// Stores one result.
    ///
    /// # Errors
    /// Returns a `PersistenceError` if the result could not be stored.
    async fn persist_result(&self, result: &BatchResult) -> Result<(), PersistenceError>;
}

/// Writes each result to `<dir>/<batch_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    dir: PathBuf,
}

impl JsonFilePersister {
    /// Persists into `dir`, created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a batch result is written to.
    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        let file_name: String = batch_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl ResultPersister for JsonFilePersister {
    async fn persist_result(&self, result: &BatchResult) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(&result.id), json).await?;
        Ok(())
    }
}

/// Keeps results in memory, keyed by batch ID.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    results: Mutex<HashMap<String, BatchResult>>,
}

impl InMemoryPersister {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored result for a batch.
    pub fn get(&self, batch_id: &str) -> Option<BatchResult> {
        self.results.lock().get(batch_id).cloned()
    }

    /// Number of stored results.
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    /// Returns `true` if nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[async_trait]
impl ResultPersister for InMemoryPersister {
    async fn persist_result(&self, result: &BatchResult) -> Result<(), PersistenceError> {
        self.results.lock().insert(result.id.clone(), result.clone());
        Ok(())
    }
}
