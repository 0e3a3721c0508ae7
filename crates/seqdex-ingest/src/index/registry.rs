//! Shared registry of open index readers

use super::reader::EntryIndexReader;
use crate::error::IndexError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Readers keyed by index directory, opened once and shared
#[derive(Default)]
pub struct IndexRegistry {
    readers: Mutex<HashMap<PathBuf, Arc<EntryIndexReader>>>,
    rebase: Option<PathBuf>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readers opened from now on resolve relocatable sources against `dir`
    pub fn with_rebase(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rebase = Some(dir.into());
        self
    }

    /// Reader for `path`, opening it on first use
    pub fn open_reader(&self, path: &Path, load_fully_in_memory: bool) -> Result<Arc<EntryIndexReader>, IndexError> {
        let mut readers = self.lock()?;
        if let Some(reader) = readers.get(path) {
            return Ok(Arc::clone(reader));
        }

        let mut reader = EntryIndexReader::open(path, load_fully_in_memory)?;
        if let Some(base) = &self.rebase {
            reader = reader.with_rebase(base.clone());
        }
        let reader = Arc::new(reader);
        readers.insert(path.to_path_buf(), Arc::clone(&reader));
        Ok(reader)
    }

    /// Drop the registry's handle on `path`; true if one was open
    pub fn close(&self, path: &Path) -> Result<bool, IndexError> {
        let closed = self.lock()?.remove(path).is_some();
        if closed {
            debug!(index = %path.display(), "Closed index reader");
        }
        Ok(closed)
    }

    /// Drop every handle; returns how many were open
    pub fn close_all(&self) -> Result<usize, IndexError> {
        let mut readers = self.lock()?;
        let count = readers.len();
        readers.clear();
        Ok(count)
    }

    pub fn open_count(&self) -> usize {
        self.lock().map(|readers| readers.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Arc<EntryIndexReader>>>, IndexError> {
        self.readers.lock().map_err(|_| IndexError::LockPoisoned)
    }
}
