//! Deduplicating image puller.
//!
//! Concurrent pulls of the same identity share one transfer:
//!
//! ```text
//!   caller A ──┐                       ┌──▶ outcome (A)
//!              ├──▶ slot[id] (OnceCell) ┤
//!   caller B ──┘     one transfer       └──▶ same outcome (B)
//! ```
//!
//! The slot is dropped from the table once it holds an outcome, success or
//! failure, so a later pull performs a fresh transfer. A failed transfer
//! leaves neither a temp file nor an artifact behind.

use super::fetch::ImageFetcher;
use super::reference::{AuthConfig, ImageRef, RegistryEndpoints};
use crate::error::{Error, Result};
use crate::state::temp_path_for;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Artifact produced by a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub id: String,
    pub path: PathBuf,
    /// Reference digests plus the artifact's `sha256:` digest.
    pub digests: Vec<String>,
    pub size: u64,
}

type Outcome = std::result::Result<PulledImage, Arc<Error>>;
type Slot = Arc<OnceCell<Outcome>>;

/// Fetches images into the store directory, one transfer per identity at a time.
pub struct Puller {
    store_dir: PathBuf,
    fetcher: Arc<dyn ImageFetcher>,
    endpoints: RegistryEndpoints,
    cancel: CancellationToken,
    timeout: Duration,
    inflight: Mutex<HashMap<String, Slot>>,
}

/// Drops a completed slot from the table when its participant leaves.
struct SlotGuard<'a> {
    inflight: &'a Mutex<HashMap<String, Slot>>,
    id: String,
    slot: Slot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.slot.initialized() {
            // Cancelled leader; a waiting caller takes over the transfer.
            return;
        }
        if let Ok(mut inflight) = self.inflight.lock()
            && inflight
                .get(&self.id)
                .is_some_and(|current| Arc::ptr_eq(current, &self.slot))
        {
            inflight.remove(&self.id);
        }
    }
}

impl Puller {
    pub fn new(
        store_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn ImageFetcher>,
        endpoints: RegistryEndpoints,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            store_dir: store_dir.into(),
            fetcher,
            endpoints,
            cancel,
            timeout,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of identities with a transfer in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Pulls `image`, joining an in-flight transfer of the same identity.
    ///
    /// Every participant of a shared transfer observes the same outcome; a
    /// failure is reported as [`Error::Shared`].
    pub async fn pull(&self, image: &ImageRef, auth: Option<&AuthConfig>) -> Result<PulledImage> {
        let id = image.id();
        let slot = {
            let mut inflight = self.inflight.lock().map_err(|_| Error::lock_poisoned())?;
            let slot = inflight.entry(id.clone()).or_default();
            if slot.initialized() {
                // Settled outcome whose participants are still unwinding.
                *slot = Slot::default();
            }
            Arc::clone(slot)
        };
        let _guard = SlotGuard {
            inflight: &self.inflight,
            id: id.clone(),
            slot: Arc::clone(&slot),
        };

        let mut leader = false;
        let outcome = slot
            .get_or_init(|| {
                leader = true;
                self.transfer(image, auth)
            })
            .await;
        if !leader {
            debug!(image = %id, "joined in-flight pull");
        }

        match outcome {
            Ok(pulled) => Ok(pulled.clone()),
            Err(e) => Err(Error::Shared(Arc::clone(e))),
        }
    }

    async fn transfer(&self, image: &ImageRef, auth: Option<&AuthConfig>) -> Outcome {
        let id = image.id();
        let dest = self.store_dir.join(&id);
        let temp = temp_path_for(&dest);
        info!(image = %image, id = %id, "pulling image");

        // Removes the partial download on failure and when this leader is
        // dropped mid-transfer.
        let mut staged = StagedFile {
            path: temp.clone(),
            keep: false,
        };
        let work = async {
            image
                .pull(self.fetcher.as_ref(), &self.endpoints, auth, &temp)
                .await?;
            let (digest, size) = hash_file(&temp).await?;
            tokio::fs::rename(&temp, &dest)
                .await
                .map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            Ok::<_, Error>((digest, size))
        };

        let result = tokio::select! {
            r = tokio::time::timeout(self.timeout, work) => {
                r.unwrap_or_else(|_| Err(Error::Timeout {
                    operation: format!("pull {image}"),
                    duration: self.timeout,
                }))
            }
            _ = self.cancel.cancelled() => Err(Error::Cancelled(format!("pull {image}"))),
        };

        match result {
            Ok((digest, size)) => {
                staged.keep = true;
                let mut digests = image.digests();
                digests.push(digest);
                info!(id = %id, size, "image pulled");
                Ok(PulledImage {
                    id,
                    path: dest,
                    digests,
                    size,
                })
            }
            Err(e) => {
                warn!(image = %image, error = %e, "image pull failed");
                Err(Arc::new(e))
            }
        }
    }
}

/// Temp download that is deleted unless the transfer completed.
struct StagedFile {
    path: PathBuf,
    keep: bool,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Returns the `sha256:` digest and size of a file.
async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_hash_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let (digest, size) = hash_file(&path).await.unwrap();
        assert_eq!(
            digest,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(size, 11);
    }
}
