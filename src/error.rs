//! Error types for the runtime shim.
//!
//! Every error carries enough structure for logs, and classifies into one of
//! the remote-call status kinds through [`Error::kind`].

use std::path::PathBuf;
use std::sync::Arc;

/// Result type alias for shim operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Status class reported to remote callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown sandbox, container or image identity.
    NotFound,
    /// Entity with the same identity or metadata already exists.
    AlreadyExists,
    /// Operation is illegal in the entity's current state.
    FailedPrecondition,
    /// Malformed reference or specification.
    InvalidArgument,
    /// Transient failure, safe to retry.
    Unavailable,
    /// Helper launch failure, storage I/O failure, or a broken invariant.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "NotFound"),
            Self::AlreadyExists => write!(f, "AlreadyExists"),
            Self::FailedPrecondition => write!(f, "FailedPrecondition"),
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::Unavailable => write!(f, "Unavailable"),
            Self::Internal => write!(f, "Internal"),
        }
    }
}

/// Errors that can occur in the runtime shim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Pod sandbox not found.
    #[error("pod sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image not found in the local store or on the remote registry.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Pod sandbox with the same metadata already exists.
    #[error("pod sandbox already exists: {0}")]
    SandboxAlreadyExists(String),

    /// Container with the same metadata already exists in the sandbox.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Entity is in the wrong state for the operation.
    #[error("{entity} '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        entity: &'static str,
        id: String,
        state: String,
        expected: String,
    },

    /// Sandbox still owns containers.
    #[error("pod sandbox '{id}' still has {count} container(s)")]
    SandboxNotEmpty { id: String, count: usize },

    /// Image is still referenced by containers.
    #[error("image '{id}' is in use by container(s): {}", .containers.join(", "))]
    ImageInUse { id: String, containers: Vec<String> },

    /// Image has a pull in progress.
    #[error("image '{0}' is being pulled")]
    ImagePullInProgress(String),

    /// Output streams are not available for this container.
    #[error("streams of container '{0}' are not available")]
    StreamUnavailable(String),

    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Malformed sandbox/container specification or request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Image pull failed on the registry side.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Operation was cancelled by service shutdown.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Capacity limit reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Outcome of a pull shared between deduplicated callers.
    #[error("{0}")]
    Shared(Arc<Error>),

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    /// Starter helper failed to launch or to confirm readiness.
    #[error("failed to launch starter for {entity}: {reason}")]
    StarterLaunchFailed { entity: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Exec failed.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classifies the error into a remote-call status kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SandboxNotFound(_) | Self::ContainerNotFound(_) | Self::ImageNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::SandboxAlreadyExists(_) | Self::ContainerAlreadyExists(_) => {
                ErrorKind::AlreadyExists
            }
            Self::InvalidState { .. }
            | Self::SandboxNotEmpty { .. }
            | Self::ImageInUse { .. }
            | Self::ImagePullInProgress(_)
            | Self::StreamUnavailable(_) => ErrorKind::FailedPrecondition,
            Self::InvalidImageReference { .. } | Self::InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
            Self::ImagePullFailed { .. }
            | Self::Timeout { .. }
            | Self::Cancelled(_)
            | Self::ResourceExhausted(_) => ErrorKind::Unavailable,
            Self::Shared(inner) => inner.kind(),
            Self::StarterLaunchFailed { .. }
            | Self::SignalFailed { .. }
            | Self::ExecFailed { .. }
            | Self::StorageInitFailed { .. }
            | Self::StorageWriteFailed(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn lock_poisoned() -> Self {
        Self::Internal("lock poisoned".to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_error_keeps_kind() {
        let inner = Arc::new(Error::ImageNotFound("app.sif".to_string()));
        let shared = Error::Shared(inner);
        assert_eq!(shared.kind(), ErrorKind::NotFound);
        assert_eq!(shared.to_string(), "image not found: app.sif");
    }

    #[test]
    fn test_image_in_use_lists_containers() {
        let err = Error::ImageInUse {
            id: "app.sif".to_string(),
            containers: vec!["c1".to_string(), "c2".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert!(err.to_string().contains("c1, c2"));
    }
}
