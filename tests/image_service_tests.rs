//! Tests for the image service: pull, index merge, queries and removal.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sycri::image::{
    Endpoint, ImageFetcher, ImageRef, ImageService, ImageUsage, RegistryEndpoints,
};
use sycri::{Error, ErrorKind, Result};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

/// Fetcher that writes the remote locator and records the endpoint used.
///
/// With `gated` set, a fetch signals `entered` and waits for `release`.
#[derive(Default)]
struct StubFetcher {
    fail: AtomicBool,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
    servers: Mutex<Vec<String>>,
    locators: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, image: &ImageRef, endpoint: &Endpoint, dest: &Path) -> Result<()> {
        self.servers.lock().unwrap().push(endpoint.server.clone());
        self.locators.lock().unwrap().push(image.locator(endpoint));
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ImageNotFound(image.remote()));
        }
        tokio::fs::write(dest, image.remote().as_bytes()).await?;
        Ok(())
    }
}

/// Usage table with a fixed set of referencing containers.
struct FixedUsage(Vec<(String, String)>);

impl ImageUsage for FixedUsage {
    fn containers_using(&self, image_id: &str) -> Result<Vec<String>> {
        Ok(self
            .0
            .iter()
            .filter(|(_, image)| image == image_id)
            .map(|(container, _)| container.clone())
            .collect())
    }
}

fn endpoints() -> RegistryEndpoints {
    RegistryEndpoints {
        library: "https://library.example".to_string(),
        docker: "registry.example".to_string(),
        keys: String::new(),
    }
}

fn open(dir: &Path, fetcher: Arc<StubFetcher>) -> ImageService {
    ImageService::open(dir, endpoints(), fetcher, CancellationToken::new()).unwrap()
}

// =============================================================================
// Pull and Status
// =============================================================================

#[tokio::test]
async fn test_pull_merges_tags() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));

    let first = service.pull("alice/mycol/app:1.0", None).await.unwrap();
    let second = service.pull("alice/mycol/app:2.0,stable", None).await.unwrap();
    assert_eq!(first, second);

    let record = service.status("alice/mycol/app").unwrap();
    assert_eq!(record.id, "alice_mycol_app.sif");
    assert_eq!(
        record.tags.iter().map(String::as_str).collect::<Vec<_>>(),
        ["1.0", "2.0", "stable"]
    );
    assert!(record.path.is_file());
    assert!(record.size > 0);
    assert_eq!(service.list(None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_status_by_identity_and_reference() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));
    let id = service.pull("docker://nginx:1.25", None).await.unwrap();

    assert_eq!(service.status(&id).unwrap().id, id);
    assert_eq!(service.status("docker://nginx").unwrap().id, id);
    assert_eq!(service.list(Some(&id)).unwrap().len(), 1);
    assert!(service.list(Some("app")).unwrap().is_empty());
}

#[tokio::test]
async fn test_status_of_unknown_image() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));

    let err = service.status("alice/mycol/app").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = service.status("a/b/c/d").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_failed_pull_leaves_no_record() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(StubFetcher::default());
    fetcher.fail.store(true, Ordering::SeqCst);
    let service = open(temp.path(), Arc::clone(&fetcher));

    let err = service.pull("app", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(service.list(None).unwrap().is_empty());
    assert!(!temp.path().join("app.sif").exists());
}

#[tokio::test]
async fn test_server_override() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(StubFetcher::default());
    let service = open(temp.path(), Arc::clone(&fetcher));

    let auth = sycri::AuthConfig {
        server_address: "https://mirror.example".to_string(),
        ..Default::default()
    };
    service.pull("app", Some(&auth)).await.unwrap();
    service.pull("app", None).await.unwrap();

    let servers = fetcher.servers.lock().unwrap().clone();
    assert_eq!(servers, ["https://mirror.example", "https://library.example"]);
}

#[tokio::test]
async fn test_docker_server_override_rewrites_locator() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(StubFetcher::default());
    let service = open(temp.path(), Arc::clone(&fetcher));

    let auth = sycri::AuthConfig {
        server_address: "mirror.example".to_string(),
        ..Default::default()
    };
    let id = service.pull("docker://nginx:1.25", Some(&auth)).await.unwrap();
    service.pull("docker://nginx:1.25", None).await.unwrap();
    service.pull("docker://quay.io/org/tool:v1", Some(&auth)).await.unwrap();

    let locators = fetcher.locators.lock().unwrap().clone();
    assert_eq!(
        locators,
        [
            "docker://mirror.example/library/nginx:1.25",
            "docker://registry.example/library/nginx:1.25",
            "docker://quay.io/org/tool:v1",
        ]
    );
    // The identity keeps naming the default registry.
    assert_eq!(id, "docker.io_library_nginx.sif");
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let service = open(temp.path(), Arc::new(StubFetcher::default()));
        service.pull("alice/mycol/app:1.0", None).await.unwrap();
    }
    let service = open(temp.path(), Arc::new(StubFetcher::default()));
    let record = service.status("alice_mycol_app.sif").unwrap();
    assert!(record.tags.contains("1.0"));
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn test_remove_unreferenced_image() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));
    let id = service.pull("app", None).await.unwrap();
    let path = service.status(&id).unwrap().path;

    service.remove("app", &FixedUsage(Vec::new())).unwrap();
    assert!(!path.exists());
    assert_eq!(service.status(&id).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        service.remove(&id, &FixedUsage(Vec::new())).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_remove_referenced_image_fails() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));
    let id = service.pull("app", None).await.unwrap();

    let usage = FixedUsage(vec![("c1".to_string(), id.clone())]);
    let err = service.remove(&id, &usage).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert!(err.to_string().contains("c1"));
    assert!(service.status(&id).unwrap().path.is_file());
}

#[tokio::test]
async fn test_fs_info_counts_store() {
    let temp = TempDir::new().unwrap();
    let service = open(temp.path(), Arc::new(StubFetcher::default()));
    service.pull("app", None).await.unwrap();

    let usage = service.fs_info().unwrap();
    assert_eq!(usage.path, temp.path());
    // Artifact plus index.
    assert!(usage.inodes_used >= 2);
    assert!(usage.used_bytes > 0);
}

#[tokio::test]
async fn test_remove_during_pull_fails() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(StubFetcher::default());
    let service = open(temp.path(), Arc::clone(&fetcher));
    let id = service.pull("app", None).await.unwrap();

    fetcher.gated.store(true, Ordering::SeqCst);
    let pull = service.pull("app", None);
    tokio::pin!(pull);
    tokio::select! {
        r = &mut pull => panic!("gated pull finished early: {r:?}"),
        _ = fetcher.entered.notified() => {}
    }

    let err = service.remove(&id, &FixedUsage(Vec::new())).unwrap_err();
    assert!(matches!(err, Error::ImagePullInProgress(ref busy) if *busy == id));
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    fetcher.release.notify_one();
    assert_eq!(pull.await.unwrap(), id);
    let path = service.status(&id).unwrap().path;
    assert!(path.is_file());

    service.remove(&id, &FixedUsage(Vec::new())).unwrap();
    assert!(!path.exists());
}
