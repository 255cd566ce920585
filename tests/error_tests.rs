//! Tests for error types.
//!
//! Validates display formatting and the classification of every error
//! category into a remote-call status kind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sycri::{Error, ErrorKind};

// =============================================================================
// Lookup Error Tests
// =============================================================================

#[test]
fn test_not_found_kinds() {
    for err in [
        Error::SandboxNotFound("s1".to_string()),
        Error::ContainerNotFound("c1".to_string()),
        Error::ImageNotFound("app.sif".to_string()),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
        assert!(err.to_string().contains("not found"));
    }
}

#[test]
fn test_already_exists_display() {
    let err = Error::SandboxAlreadyExists("default/web (attempt 0) as abc".to_string());
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert!(err.to_string().contains("default/web"));
}

// =============================================================================
// Precondition Error Tests
// =============================================================================

#[test]
fn test_invalid_state_display() {
    let err = Error::InvalidState {
        entity: "container",
        id: "c1".to_string(),
        state: "RUNNING".to_string(),
        expected: "not RUNNING".to_string(),
    };
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    let msg = err.to_string();
    assert!(msg.contains("c1"), "should include the container ID");
    assert!(msg.contains("RUNNING"), "should include the current state");
}

#[test]
fn test_sandbox_not_empty_display() {
    let err = Error::SandboxNotEmpty {
        id: "s1".to_string(),
        count: 2,
    };
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert!(err.to_string().contains("2 container"));
}

// =============================================================================
// Transient Error Tests
// =============================================================================

#[test]
fn test_transient_errors_are_unavailable() {
    let errors = [
        Error::ImagePullFailed {
            reference: "library://app".to_string(),
            reason: "connection reset".to_string(),
        },
        Error::Timeout {
            operation: "pull library://app".to_string(),
            duration: Duration::from_secs(600),
        },
        Error::Cancelled("pull library://app".to_string()),
        Error::ResourceExhausted("maximum number of sandboxes (1024) reached".to_string()),
    ];
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::Unavailable, "{err}");
    }
}

#[test]
fn test_shared_error_is_transparent() {
    let inner = Error::ImagePullFailed {
        reference: "library://app".to_string(),
        reason: "502".to_string(),
    };
    let expected = inner.to_string();
    let shared = Error::Shared(Arc::new(inner));
    assert_eq!(shared.kind(), ErrorKind::Unavailable);
    assert_eq!(shared.to_string(), expected);
}

// =============================================================================
// Internal Error Tests
// =============================================================================

#[test]
fn test_internal_kinds() {
    let errors = [
        Error::StarterLaunchFailed {
            entity: "sandbox s1".to_string(),
            reason: "starter exited before readiness".to_string(),
        },
        Error::StorageInitFailed {
            path: PathBuf::from("/var/lib/singularity"),
            reason: "permission denied".to_string(),
        },
        Error::StorageWriteFailed("disk full".to_string()),
        Error::Io(std::io::Error::other("boom")),
        Error::Internal("lock poisoned".to_string()),
    ];
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::Internal, "{err}");
    }
}

#[test]
fn test_invalid_reference_display() {
    let err = Error::InvalidImageReference {
        reference: "a/b/c/d".to_string(),
        reason: "more than 3 path segments".to_string(),
    };
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let msg = err.to_string();
    assert!(msg.contains("a/b/c/d"));
    assert!(msg.contains("more than 3 path segments"));
}

#[test]
fn test_serde_error_converts() {
    let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().starts_with("serialization error"));
}

#[test]
fn test_kind_wire_names() {
    assert_eq!(
        serde_json::to_string(&ErrorKind::FailedPrecondition).unwrap(),
        "\"failed_precondition\""
    );
    assert_eq!(ErrorKind::NotFound.to_string(), "NotFound");
}
