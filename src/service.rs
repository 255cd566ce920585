//! # Service Facades
//!
//! Thin translation from remote calls to manager operations. Two groups:
//!
//! | Facade | Calls |
//! |--------|-------|
//! | [`RuntimeService`] | Version, Status, sandbox and container lifecycle, ExecSync, Exec, Attach |
//! | [`ImageManagementService`] | PullImage, ListImages, ImageStatus, RemoveImage, ImageFsInfo |
//!
//! Neither facade holds state of its own; both borrow the managers of a
//! shared [`RuntimeContext`].

use crate::constants::{RUNTIME_API_VERSION, RUNTIME_NAME, SANDBOX_STOP_TIMEOUT};
use crate::container::{Attachment, ContainerConfig, ContainerFilter, ContainerStatus};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::image::{AuthConfig, FilesystemUsage, ImageRecord};
use crate::pod::{SandboxConfig, SandboxFilter, SandboxStatus};
use crate::runtime::{ExecOptions, ExecResult};
use crate::starter::ExecSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Runtime identification returned by `Version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

/// One readiness condition reported by `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Readiness report returned by `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub conditions: Vec<RuntimeCondition>,
}

pub const CONDITION_RUNTIME_READY: &str = "RuntimeReady";
pub const CONDITION_NETWORK_READY: &str = "NetworkReady";

// =============================================================================
// Runtime Service
// =============================================================================

/// Sandbox and container lifecycle facade.
#[derive(Clone)]
pub struct RuntimeService {
    context: Arc<RuntimeContext>,
}

impl RuntimeService {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self { context }
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            version: RUNTIME_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        }
    }

    /// Reports runtime and network readiness.
    ///
    /// The runtime is ready when the starter helper exists on disk. A bare
    /// program name is looked up through `PATH` at launch and counts as ready.
    pub fn status(&self) -> RuntimeStatus {
        let starter = &self.context.config().starter_path;
        let runtime_ready = starter.components().count() == 1 || starter.is_file();
        let (reason, message) = if runtime_ready {
            (String::new(), String::new())
        } else {
            (
                "StarterMissing".to_string(),
                format!("starter helper {} not found", starter.display()),
            )
        };
        RuntimeStatus {
            conditions: vec![
                RuntimeCondition {
                    kind: CONDITION_RUNTIME_READY.to_string(),
                    status: runtime_ready,
                    reason,
                    message,
                },
                RuntimeCondition {
                    kind: CONDITION_NETWORK_READY.to_string(),
                    status: true,
                    reason: String::new(),
                    message: String::new(),
                },
            ],
        }
    }

    // =========================================================================
    // Pod Sandboxes
    // =========================================================================

    pub async fn run_pod_sandbox(&self, config: SandboxConfig) -> Result<String> {
        self.context.sandboxes().run(config).await
    }

    /// Stops every container of the sandbox, then the sandbox itself.
    pub async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let sandboxes = self.context.sandboxes();
        let containers = self.context.containers();
        // Surfaces NotFound before touching any container.
        sandboxes.status(id)?;

        for container in containers.ids_in_sandbox(id)? {
            if let Err(e) = containers.stop(&container, SANDBOX_STOP_TIMEOUT).await {
                warn!(
                    sandbox = %id,
                    container = %container,
                    error = %e,
                    "failed to stop container"
                );
                return Err(e);
            }
        }
        sandboxes.stop(id).await
    }

    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let containers = Arc::clone(self.context.containers());
        self.context
            .sandboxes()
            .remove(id, |sandbox| containers.count_in_sandbox(sandbox))
            .await
    }

    pub fn pod_sandbox_status(&self, id: &str) -> Result<SandboxStatus> {
        self.context.sandboxes().status(id)
    }

    pub fn list_pod_sandbox(&self, filter: &SandboxFilter) -> Result<Vec<SandboxStatus>> {
        self.context.sandboxes().list(filter)
    }

    // =========================================================================
    // Containers
    // =========================================================================

    pub fn create_container(&self, sandbox_id: &str, config: ContainerConfig) -> Result<String> {
        self.context.containers().create(sandbox_id, config)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.context.containers().start(id).await
    }

    /// Stops a container, waiting `timeout_secs` before SIGKILL.
    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.context
            .containers()
            .stop(id, Duration::from_secs(timeout_secs))
            .await
    }

    pub async fn remove_container(&self, id: &str) -> Result<()> {
        self.context.containers().remove(id).await
    }

    pub fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        self.context.containers().status(id)
    }

    pub fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerStatus>> {
        self.context.containers().list(filter)
    }

    /// Runs a command to completion. A zero timeout waits indefinitely.
    pub async fn exec_sync(
        &self,
        id: &str,
        cmd: &[String],
        timeout_secs: u64,
    ) -> Result<ExecResult> {
        let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        self.context.containers().exec_sync(id, cmd, timeout).await
    }

    pub async fn exec(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<ExecSession> {
        self.context.containers().exec(id, cmd, opts).await
    }

    pub fn attach(&self, id: &str) -> Result<Attachment> {
        self.context.containers().attach(id)
    }
}

// =============================================================================
// Image Service
// =============================================================================

/// Image management facade.
#[derive(Clone)]
pub struct ImageManagementService {
    context: Arc<RuntimeContext>,
}

impl ImageManagementService {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self { context }
    }

    /// Pulls an image and returns its identity.
    pub async fn pull_image(&self, image: &str, auth: Option<&AuthConfig>) -> Result<String> {
        self.context.images().pull(image, auth).await
    }

    pub fn list_images(&self, filter: Option<&str>) -> Result<Vec<ImageRecord>> {
        self.context.images().list(filter)
    }

    pub fn image_status(&self, image: &str) -> Result<ImageRecord> {
        self.context.images().status(image)
    }

    pub fn remove_image(&self, image: &str) -> Result<()> {
        let containers = self.context.containers();
        self.context.images().remove(image, containers.as_ref())
    }

    pub fn image_fs_info(&self) -> Result<FilesystemUsage> {
        self.context.images().fs_info()
    }
}
