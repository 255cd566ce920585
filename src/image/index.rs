//! # Image Store Index
//!
//! Authoritative mapping from image identity to stored metadata, persisted as
//! `<store_dir>/index.json`:
//!
//! ```text
//! <store_dir>/
//! ├── index.json
//! ├── alice_mycol_app.sif
//! └── docker.io_library_nginx.sif
//! ```
//!
//! Every mutation writes the full index to a temp file and renames it over
//! `index.json` before the in-memory map changes, so readers only ever see
//! committed records.

use super::puller::PulledImage;
use crate::constants::IMAGE_INDEX_FILE;
use crate::error::{Error, Result};
use crate::state::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stored image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Identity, also the artifact file name.
    pub id: String,
    pub path: PathBuf,
    /// Remote locator of the last pull.
    pub remote: String,
    /// Tags accumulated over all pulls.
    pub tags: BTreeSet<String>,
    pub digests: BTreeSet<String>,
    pub size: u64,
    pub pulled_at: DateTime<Utc>,
}

/// In-memory view of `index.json`.
#[derive(Debug)]
pub struct ImageIndex {
    path: PathBuf,
    records: BTreeMap<String, ImageRecord>,
}

impl ImageIndex {
    /// Loads the index of `store_dir`.
    ///
    /// Entries whose artifact file has disappeared are dropped.
    pub fn load(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(IMAGE_INDEX_FILE);
        let mut records: BTreeMap<String, ImageRecord> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::StorageInitFailed {
                path: path.clone(),
                reason: format!("corrupt image index: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::StorageInitFailed {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let before = records.len();
        records.retain(|id, record| {
            let present = record.path.is_file();
            if !present {
                warn!(
                    image = %id,
                    path = %record.path.display(),
                    "dropping index entry without artifact"
                );
            }
            present
        });

        let index = Self { path, records };
        if index.records.len() != before {
            index.write(&index.records)?;
        }
        info!(count = index.records.len(), "image index loaded");
        Ok(index)
    }

    fn write(&self, records: &BTreeMap<String, ImageRecord>) -> Result<()> {
        write_json_atomic(&self.path, records)
    }

    pub fn get(&self, id: &str) -> Option<&ImageRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Commits a pulled artifact, merging tags and digests into an existing record.
    pub fn commit(
        &mut self,
        pulled: &PulledImage,
        remote: String,
        tags: &[String],
    ) -> Result<ImageRecord> {
        let mut records = self.records.clone();
        let record = records
            .entry(pulled.id.clone())
            .or_insert_with(|| ImageRecord {
                id: pulled.id.clone(),
                path: pulled.path.clone(),
                remote: remote.clone(),
                tags: BTreeSet::new(),
                digests: BTreeSet::new(),
                size: 0,
                pulled_at: Utc::now(),
            });
        record.path = pulled.path.clone();
        record.remote = remote;
        record.tags.extend(tags.iter().cloned());
        record.digests.extend(pulled.digests.iter().cloned());
        record.size = pulled.size;
        record.pulled_at = Utc::now();
        let record = record.clone();

        self.write(&records)?;
        self.records = records;
        Ok(record)
    }

    /// Removes a record from the index. The artifact is left to the caller.
    pub fn remove(&mut self, id: &str) -> Result<Option<ImageRecord>> {
        if !self.records.contains_key(id) {
            return Ok(None);
        }
        let mut records = self.records.clone();
        let removed = records.remove(id);
        self.write(&records)?;
        self.records = records;
        Ok(removed)
    }
}
