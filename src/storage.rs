//! Durable storage boundary for scan history.
//!
//! The history store hands over a fully serialized document on every change and
//! reads it back once at start-up. Backends only move bytes; they never look
//! inside the document.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::StorageError;

pub trait StoragePort: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<String>, StorageError>;
    fn save(&self, document: &str) -> Result<(), StorageError>;
}

/// Keeps the history document in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
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
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StoragePort for JsonFileStorage {
    fn load(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved history");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, document: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // write-then-rename so a crash never leaves a truncated document behind
        let tmp = self.temp_path();
        fs::write(&tmp, document)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process backend; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemorySlot>>,
}

#[derive(Debug, Default)]
struct MemorySlot {
    document: Option<String>,
    fail_saves: bool,
    saves: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<String>) -> Self {
        let storage = Self::default();
        storage.slot().document = Some(document.into());
        storage
    }

    /// Make every following `save` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.slot().fail_saves = fail;
    }

    pub fn document(&self) -> Option<String> {
        self.slot().document.clone()
    }

    pub fn save_count(&self) -> usize {
        self.slot().saves
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, MemorySlot> {
        // a poisoned slot still holds a usable document
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StoragePort for MemoryStorage {
    fn load(&self) -> Result<Option<String>, StorageError> {
        Ok(self.slot().document.clone())
    }

    fn save(&self, document: &str) -> Result<(), StorageError> {
        let mut slot = self.slot();
        if slot.fail_saves {
            return Err(StorageError::Unavailable("saves disabled".into()));
        }
        slot.document = Some(document.to_string());
        slot.saves += 1;
        Ok(())
    }
}
