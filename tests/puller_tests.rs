//! Tests for the deduplicating image puller.
//!
//! A counting fetcher stands in for the registries so that transfers can be
//! observed, delayed and failed on demand.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sycri::image::{Endpoint, ImageFetcher, ImageRef, Puller, RegistryEndpoints};
use sycri::{Error, ErrorKind, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

/// Fetcher that counts transfers and can be told to fail.
///
/// With `partial` set, part of the payload is written before the delay.
#[derive(Default)]
struct CountingFetcher {
    transfers: AtomicUsize,
    fail: AtomicBool,
    partial: AtomicBool,
    delay: Duration,
}

impl CountingFetcher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for CountingFetcher {
    async fn fetch(&self, image: &ImageRef, _endpoint: &Endpoint, dest: &Path) -> Result<()> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        if self.partial.load(Ordering::SeqCst) {
            tokio::fs::write(dest, b"partial").await?;
        }
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ImagePullFailed {
                reference: image.remote(),
                reason: "registry unavailable".to_string(),
            });
        }
        tokio::fs::write(dest, image.remote().as_bytes()).await?;
        Ok(())
    }
}

fn endpoints() -> RegistryEndpoints {
    RegistryEndpoints {
        library: "https://library.example".to_string(),
        docker: "registry.example".to_string(),
        keys: String::new(),
    }
}

fn puller(dir: &Path, fetcher: Arc<CountingFetcher>, timeout: Duration) -> Puller {
    Puller::new(dir, fetcher, endpoints(), CancellationToken::new(), timeout)
}

fn stray_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp."))
        .collect()
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test]
async fn test_concurrent_pulls_share_one_transfer() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(100)));
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));

    let a = ImageRef::resolve("alice/mycol/app:1.0").unwrap();
    let b = ImageRef::resolve("alice/mycol/app:2.0").unwrap();
    let (first, second) = tokio::join!(puller.pull(&a, None), puller.pull(&b, None));

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(fetcher.transfers(), 1, "same identity must transfer once");
    assert_eq!(first, second);
    assert_eq!(first.id, "alice_mycol_app.sif");
    assert!(first.path.is_file());
    assert!(first.digests.iter().any(|d| d.starts_with("sha256:")));
    assert_eq!(puller.inflight(), 0);
}

#[tokio::test]
async fn test_distinct_identities_transfer_independently() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(50)));
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));

    let a = ImageRef::resolve("alice/mycol/app").unwrap();
    let b = ImageRef::resolve("alice/mycol/other").unwrap();
    let (first, second) = tokio::join!(puller.pull(&a, None), puller.pull(&b, None));

    assert_ne!(first.unwrap().id, second.unwrap().id);
    assert_eq!(fetcher.transfers(), 2);
}

#[tokio::test]
async fn test_shared_failure_reaches_every_caller() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(100)));
    fetcher.fail.store(true, Ordering::SeqCst);
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));

    let image = ImageRef::resolve("alice/mycol/app").unwrap();
    let (first, second) = tokio::join!(puller.pull(&image, None), puller.pull(&image, None));

    let first = first.unwrap_err();
    let second = second.unwrap_err();
    assert_eq!(fetcher.transfers(), 1);
    assert_eq!(first.kind(), ErrorKind::Unavailable);
    assert_eq!(first.to_string(), second.to_string());
    assert!(!temp.path().join("alice_mycol_app.sif").exists());
    assert!(stray_files(temp.path()).is_empty());
}

#[tokio::test]
async fn test_retry_after_failure_transfers_again() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::default());
    fetcher.fail.store(true, Ordering::SeqCst);
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));
    let image = ImageRef::resolve("app").unwrap();

    assert!(puller.pull(&image, None).await.is_err());
    fetcher.fail.store(false, Ordering::SeqCst);
    let pulled = puller.pull(&image, None).await.unwrap();

    assert_eq!(fetcher.transfers(), 2);
    assert_eq!(pulled.id, "app.sif");
    assert!(pulled.path.is_file());
}

#[tokio::test]
async fn test_sequential_pulls_are_not_cached() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::default());
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));
    let image = ImageRef::resolve("app").unwrap();

    puller.pull(&image, None).await.unwrap();
    puller.pull(&image, None).await.unwrap();
    assert_eq!(fetcher.transfers(), 2);
}

// =============================================================================
// Timeout and Cancellation
// =============================================================================

#[tokio::test]
async fn test_timeout_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_secs(5)));
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_millis(50));
    let image = ImageRef::resolve("app").unwrap();

    let err = puller.pull(&image, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
    assert!(!temp.path().join("app.sif").exists());
    assert!(stray_files(temp.path()).is_empty());
}

#[tokio::test]
async fn test_dropped_leader_removes_partial_download() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_secs(5)));
    fetcher.partial.store(true, Ordering::SeqCst);
    let puller = puller(temp.path(), Arc::clone(&fetcher), Duration::from_secs(10));
    let image = ImageRef::resolve("app").unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), puller.pull(&image, None)).await;
    assert!(abandoned.is_err(), "pull should still be in flight");
    assert_eq!(fetcher.transfers(), 1);
    assert!(stray_files(temp.path()).is_empty());
    assert!(!temp.path().join("app.sif").exists());
}

#[tokio::test]
async fn test_cancellation_aborts_transfer() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_secs(5)));
    let cancel = CancellationToken::new();
    let puller = Puller::new(
        temp.path(),
        Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
        endpoints(),
        cancel.clone(),
        Duration::from_secs(10),
    );
    let image = ImageRef::resolve("app").unwrap();

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(puller.pull(&image, None), canceller);

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.to_string().contains("cancelled"), "unexpected error: {err}");
}
