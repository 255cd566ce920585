//! Registry transfers.
//!
//! | Kind | Transfer |
//! |------|----------|
//! | library | `GET <server>/v1/imagefile/<path>:<tag>` over HTTPS |
//! | docker | `singularity build --force <dest> docker://<locator>`, default registry replaced by the endpoint |
//!
//! A fetcher writes exactly one file at `dest`; the puller owns temp naming,
//! hashing and the final rename.

use super::reference::ImageRef;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Credentials presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Token(String),
}

/// Registry server and credentials used for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub credentials: Option<Credentials>,
}

/// Transfers a resolved image into a local file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Writes the image artifact to `dest`.
    ///
    /// # Errors
    ///
    /// - [`Error::ImageNotFound`] when the registry does not know the image
    /// - [`Error::ImagePullFailed`] for other registry or network failures
    async fn fetch(&self, image: &ImageRef, endpoint: &Endpoint, dest: &Path) -> Result<()>;
}

/// Production fetcher talking to real registries.
pub struct RegistryFetcher {
    client: reqwest::Client,
    singularity: PathBuf,
}

impl RegistryFetcher {
    /// Creates a fetcher using `singularity` for docker builds.
    pub fn new(singularity: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            singularity: singularity.into(),
        })
    }

    async fn fetch_library(
        &self,
        image: &ImageRef,
        path: &str,
        tag: &str,
        endpoint: &Endpoint,
        dest: &Path,
    ) -> Result<()> {
        let reference = image.remote();
        let failed = |reason: String| Error::ImagePullFailed {
            reference: reference.clone(),
            reason,
        };

        let url = format!(
            "{}/v1/imagefile/{path}:{tag}",
            endpoint.server.trim_end_matches('/')
        );
        debug!(%url, "downloading library image");

        let mut request = self.client.get(&url);
        request = match &endpoint.credentials {
            Some(Credentials::Token(token)) => request.bearer_auth(token),
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        };

        let mut response = request.send().await.map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ImageNotFound(reference));
        }
        if !status.is_success() {
            return Err(failed(format!("library server returned {status}")));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        info!(%reference, bytes = written, "library image downloaded");
        Ok(())
    }

    async fn fetch_docker(&self, image: &ImageRef, endpoint: &Endpoint, dest: &Path) -> Result<()> {
        let reference = image.locator(endpoint);
        let mut cmd = tokio::process::Command::new(&self.singularity);
        cmd.arg("build")
            .arg("--force")
            .arg(dest)
            .arg(&reference)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &endpoint.credentials {
            Some(Credentials::Basic { username, password }) => {
                cmd.env("SINGULARITY_DOCKER_USERNAME", username)
                    .env("SINGULARITY_DOCKER_PASSWORD", password);
            }
            Some(Credentials::Token(token)) => {
                cmd.env("SINGULARITY_DOCKER_PASSWORD", token);
            }
            None => {}
        }

        debug!(%reference, "building docker image");
        let output = cmd.output().await.map_err(|e| Error::ImagePullFailed {
            reference: reference.clone(),
            reason: format!("failed to run {}: {e}", self.singularity.display()),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") || stderr.contains("MANIFEST_UNKNOWN") {
                return Err(Error::ImageNotFound(reference));
            }
            return Err(Error::ImagePullFailed {
                reference,
                reason: stderr.trim().to_string(),
            });
        }

        info!(%reference, "docker image built");
        Ok(())
    }
}

#[async_trait]
impl ImageFetcher for RegistryFetcher {
    async fn fetch(&self, image: &ImageRef, endpoint: &Endpoint, dest: &Path) -> Result<()> {
        match image {
            ImageRef::Library(library) => {
                let tag = library
                    .tags()
                    .first()
                    .map(String::as_str)
                    .unwrap_or(crate::constants::DEFAULT_TAG);
                self.fetch_library(image, &library.path(), tag, endpoint, dest)
                    .await
            }
            ImageRef::Docker(_) => self.fetch_docker(image, endpoint, dest).await,
        }
    }
}
