//! # Image Management
//!
//! ```text
//! PullImage(ref) ──▶ ImageRef::resolve ──▶ Puller (dedup + fetch) ──▶ ImageIndex::commit
//!                     library | docker       one transfer per id        tags merged
//! ```
//!
//! `ImageStatus`, `RemoveImage` and `ListImages` accept either a stored
//! identity or a reference, which is resolved to its identity.
//!
//! ## Locking
//!
//! The index sits behind one `RwLock`. Container creation binds its image
//! while holding the read lock ([`ImageService::with_record`]); removal checks
//! usage while holding the write lock. A container can therefore never be
//! created against an image that is being removed.
//!
//! A pull registers its identity before the transfer starts and leaves only
//! after the index commit. Removal of an identity with a pull registered
//! fails, so the renamed artifact and its record always appear together.

mod docker;
mod fetch;
mod index;
mod library;
mod puller;
mod reference;

pub use docker::DockerRef;
pub use fetch::{Credentials, Endpoint, ImageFetcher, RegistryFetcher};
pub use index::{ImageIndex, ImageRecord};
pub use library::LibraryRef;
pub use puller::{PulledImage, Puller};
pub use reference::{AuthConfig, ImageRef, RegistryEndpoints, RegistryKind, registry_kind};

use crate::constants::IMAGE_PULL_TIMEOUT;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reports which containers reference an image.
pub trait ImageUsage: Send + Sync {
    /// Identities of the containers bound to `image_id`.
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>>;
}

/// Usage of the image store filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    pub used_bytes: u64,
    pub inodes_used: u64,
}

/// Image service: resolve, pull, query and remove images.
pub struct ImageService {
    store_dir: PathBuf,
    index: RwLock<ImageIndex>,
    puller: Puller,
    /// Pulls between the start of the transfer and the index commit, by identity.
    pulling: Mutex<HashMap<String, usize>>,
}

/// Registers one pull of an identity for as long as it lives.
struct PullTicket<'a> {
    pulling: &'a Mutex<HashMap<String, usize>>,
    id: String,
}

impl<'a> PullTicket<'a> {
    fn new(pulling: &'a Mutex<HashMap<String, usize>>, id: String) -> Result<Self> {
        *pulling
            .lock()
            .map_err(|_| Error::lock_poisoned())?
            .entry(id.clone())
            .or_default() += 1;
        Ok(Self { pulling, id })
    }
}

impl Drop for PullTicket<'_> {
    fn drop(&mut self) {
        if let Ok(mut pulling) = self.pulling.lock()
            && let Some(count) = pulling.get_mut(&self.id)
        {
            *count -= 1;
            if *count == 0 {
                pulling.remove(&self.id);
            }
        }
    }
}

impl ImageService {
    /// Opens the image store at `store_dir`.
    pub fn open(
        store_dir: impl Into<PathBuf>,
        endpoints: RegistryEndpoints,
        fetcher: Arc<dyn ImageFetcher>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::with_timeout(store_dir, endpoints, fetcher, cancel, IMAGE_PULL_TIMEOUT)
    }

    /// Opens the image store with a custom transfer timeout.
    pub fn with_timeout(
        store_dir: impl Into<PathBuf>,
        endpoints: RegistryEndpoints,
        fetcher: Arc<dyn ImageFetcher>,
        cancel: CancellationToken,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let store_dir = store_dir.into();
        fs::create_dir_all(&store_dir).map_err(|e| Error::StorageInitFailed {
            path: store_dir.clone(),
            reason: e.to_string(),
        })?;
        remove_stale_temps(&store_dir);

        let index = ImageIndex::load(&store_dir)?;
        info!(path = %store_dir.display(), "image store opened");
        Ok(Self {
            puller: Puller::new(store_dir.clone(), fetcher, endpoints, cancel, timeout),
            store_dir,
            index: RwLock::new(index),
            pulling: Mutex::new(HashMap::new()),
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Maps a stored identity or a reference to an identity.
    fn lookup_id(index: &ImageIndex, image: &str) -> Result<String> {
        if index.contains(image) {
            return Ok(image.to_string());
        }
        Ok(ImageRef::resolve(image)?.id())
    }

    /// Pulls an image and commits it to the index. Returns its identity.
    pub async fn pull(&self, image: &str, auth: Option<&AuthConfig>) -> Result<String> {
        let resolved = ImageRef::resolve(image)?;
        // Keeps removal away from the artifact until it is committed.
        let _ticket = PullTicket::new(&self.pulling, resolved.id())?;
        let pulled = self.puller.pull(&resolved, auth).await?;

        let record = {
            let mut index = self.index.write().map_err(|_| Error::lock_poisoned())?;
            index.commit(&pulled, resolved.remote(), &resolved.tags())?
        };
        info!(image = %image, id = %record.id, tags = ?record.tags, "image committed");
        Ok(record.id)
    }

    /// Returns the record of a stored image.
    pub fn status(&self, image: &str) -> Result<ImageRecord> {
        let index = self.index.read().map_err(|_| Error::lock_poisoned())?;
        let id = Self::lookup_id(&index, image)?;
        index
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))
    }

    /// Lists stored images, optionally only the one matching `filter`.
    pub fn list(&self, filter: Option<&str>) -> Result<Vec<ImageRecord>> {
        let index = self.index.read().map_err(|_| Error::lock_poisoned())?;
        let wanted = match filter.filter(|f| !f.is_empty()) {
            Some(filter) => Some(Self::lookup_id(&index, filter)?),
            None => None,
        };
        Ok(index
            .records()
            .filter(|record| wanted.as_ref().is_none_or(|id| *id == record.id))
            .cloned()
            .collect())
    }

    /// Removes an image no container references and nobody is pulling.
    pub fn remove(&self, image: &str, usage: &dyn ImageUsage) -> Result<()> {
        let mut index = self.index.write().map_err(|_| Error::lock_poisoned())?;
        let id = Self::lookup_id(&index, image)?;
        if self
            .pulling
            .lock()
            .map_err(|_| Error::lock_poisoned())?
            .contains_key(&id)
        {
            return Err(Error::ImagePullInProgress(id));
        }
        let path = index
            .get(&id)
            .map(|record| record.path.clone())
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;

        let containers = usage.containers_using(&id)?;
        if !containers.is_empty() {
            return Err(Error::ImageInUse { id, containers });
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::StorageWriteFailed(e.to_string())),
        }
        index.remove(&id)?;
        info!(image = %id, "image removed");
        Ok(())
    }

    /// Runs `f` with a stored image's record while the index is read-locked.
    pub fn with_record<T>(
        &self,
        image: &str,
        f: impl FnOnce(&ImageRecord) -> Result<T>,
    ) -> Result<T> {
        let index = self.index.read().map_err(|_| Error::lock_poisoned())?;
        let id = Self::lookup_id(&index, image)?;
        let record = index
            .get(&id)
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;
        f(record)
    }

    /// Reports bytes and inodes used by the store directory.
    pub fn fs_info(&self) -> Result<FilesystemUsage> {
        let mut used_bytes = 0u64;
        let mut inodes_used = 0u64;
        walk_dir(&self.store_dir, &mut |meta| {
            used_bytes += meta.len();
            inodes_used += 1;
        })?;
        debug!(used_bytes, inodes_used, "image filesystem usage");
        Ok(FilesystemUsage {
            timestamp: Utc::now(),
            path: self.store_dir.clone(),
            used_bytes,
            inodes_used,
        })
    }
}

fn walk_dir(dir: &Path, callback: &mut impl FnMut(&fs::Metadata)) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        callback(&meta);
        if meta.is_dir() {
            walk_dir(&entry.path(), callback)?;
        }
    }
    Ok(())
}

fn remove_stale_temps(store_dir: &Path) {
    let Ok(entries) = fs::read_dir(store_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(name) = name.to_str()
            && name.starts_with('.')
            && name.contains(".tmp.")
        {
            debug!(file = %name, "removing interrupted download");
            let _ = fs::remove_file(entry.path());
        }
    }
}
