//! # Persistent Record Store
//!
//! Stores sandbox records, container records and starter handles as one JSON
//! document per identity so a restarted service can reconcile what it left
//! behind.
//!
//! ```text
//! <state_dir>/
//! ├── sandboxes/<id>.json
//! ├── containers/<id>.json
//! └── starters/<handle>.json
//! ```
//!
//! ## Atomic Writes
//!
//! Documents are written via a temp file + rename pattern:
//! 1. Write to `<id>.tmp.<uuid>`
//! 2. Rename to `<id>.json`
//!
//! A crash mid-write leaves either the previous document or the new one, never
//! a torn file. Leftover temp files are ignored and cleaned up on load.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory of JSON documents keyed by identity.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Opens (and creates when missing) a record directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    /// Returns the record directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `id`.
    pub fn path_of(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomically writes the document for `id`.
    pub fn save<T: Serialize>(&self, id: &str, value: &T) -> Result<()> {
        write_json_atomic(&self.path_of(id), value)
    }

    /// Removes the document for `id`. Missing documents are not an error.
    pub fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StorageWriteFailed(e.to_string())),
        }
    }

    /// Loads every document in the directory.
    ///
    /// Documents that fail to parse are skipped with a warning; temp files
    /// from interrupted writes are deleted.
    pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::StorageInitFailed {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.contains(".tmp.") {
                debug!(path = %path.display(), "removing stale temp file");
                let _ = fs::remove_file(&path);
                continue;
            }
            // Only `<id>.json`; auxiliary documents such as `<id>.config.json`
            // are owned by their writer.
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.contains('.') {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<T>(&bytes).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }

        Ok(records)
    }
}

/// Serializes `value` to `path` through a uniquely named temp file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, &data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::StorageWriteFailed(e.to_string())
    })?;
    Ok(())
}

/// Temp path next to `path` that never collides with a concurrent writer.
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    path.with_file_name(format!(".{name}.tmp.{}", uuid::Uuid::now_v7()))
}
