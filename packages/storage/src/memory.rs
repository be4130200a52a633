//! In-memory page store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{PageStore, StorageError, validate_relative_path};

/// Keeps every written page in a map keyed by relative path.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryPageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of every stored page, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Content of one page.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Content of one page parsed as JSON.
    #[must_use]
    pub fn get_json(&self, path: &str) -> Option<serde_json::Value> {
        self.get(path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    /// Number of `write_page` calls, including overwrites.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn write_page(
        &self,
        relative_path: &str,
        content: Vec<u8>,
    ) -> Result<String, StorageError> {
        validate_relative_path(relative_path)?;

        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relative_path.to_string(), content);

        Ok(format!("memory://{relative_path}"))
    }
}
