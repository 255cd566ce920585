//! # Runtime Shim Constants
//!
//! Well-known endpoints, default paths, limits and timeouts. These constants
//! are the single source of truth for the defaults of [`RuntimeConfig`] and
//! for the bounds enforced by the managers.
//!
//! [`RuntimeConfig`]: crate::config::RuntimeConfig

use std::time::Duration;

// =============================================================================
// Runtime Identity
// =============================================================================

/// Official name of the runtime reported by `Version`.
pub const RUNTIME_NAME: &str = "singularity";

/// Remote-call API version reported by `Version`.
pub const RUNTIME_API_VERSION: &str = "v1alpha2";

/// Name of the privileged helper executable that starts pods and containers.
pub const STARTER_NAME: &str = "starter";

/// Name of the engine executable used to build images from docker registries.
pub const SINGULARITY_NAME: &str = "singularity";

// =============================================================================
// Registries
// =============================================================================

/// Default library server address.
pub const LIBRARY_URL: &str = "https://library.sylabs.io";

/// Primary domain of the library registry.
pub const LIBRARY_DOMAIN: &str = "cloud.sylabs.io";

/// Scheme of library references.
pub const LIBRARY_PROTOCOL: &str = "library";

/// Primary domain of the docker registry.
pub const DOCKER_DOMAIN: &str = "docker.io";

/// Scheme of docker references.
pub const DOCKER_PROTOCOL: &str = "docker";

/// Default key management and verification server.
pub const KEYS_SERVER: &str = "https://keys.sylabs.io";

// =============================================================================
// Paths
// =============================================================================

/// Default unix socket the services are served on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/singularity.sock";

/// Default directory holding pulled images.
pub const DEFAULT_STORE_DIR: &str = "/var/lib/singularity";

/// Default directory holding sandbox, container and starter state.
pub const DEFAULT_STATE_DIR: &str = "/var/run/sycri";

/// Image index file name inside the store directory.
pub const IMAGE_INDEX_FILE: &str = "index.json";

/// Sandbox records directory under the state directory.
pub const SANDBOXES_DIR: &str = "sandboxes";

/// Container records directory under the state directory.
pub const CONTAINERS_DIR: &str = "containers";

/// Starter handles directory under the state directory.
pub const STARTERS_DIR: &str = "starters";

// =============================================================================
// Image References
// =============================================================================

/// Extension of every stored image artifact.
pub const IMAGE_EXTENSION: &str = ".sif";

/// Tag assumed when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Characters allowed in a library path segment or tag.
pub const LIBRARY_SEGMENT_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789._-";

/// Maximum number of path segments of a library reference.
pub const MAX_LIBRARY_SEGMENTS: usize = 3;

// =============================================================================
// Capacity
// =============================================================================

/// Maximum number of tracked pod sandboxes.
pub const MAX_SANDBOXES: usize = 1024;

/// Maximum number of tracked containers.
pub const MAX_CONTAINERS: usize = 4096;

/// Maximum length of sandbox/container metadata names.
pub const MAX_NAME_LEN: usize = 253;

/// Maximum bytes captured per stream by `ExecSync`.
pub const MAX_EXEC_OUTPUT: usize = 16 * 1024 * 1024;

/// Capacity of a container's live output broadcast.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Timeouts
// =============================================================================

/// Upper bound for one image transfer.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Time the starter has to report readiness.
pub const STARTER_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a process has to disappear after SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Graceful stop timeout for sandbox teardown and for containers stopped with it.
pub const SANDBOX_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness poll interval for adopted processes when pidfd is unavailable.
pub const ADOPTED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time in-flight requests get to settle on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Validates a sandbox or container metadata name.
///
/// # Errors
///
/// Returns a static reason when the name is empty, too long, or contains
/// characters outside printable ASCII without `/`.
pub fn validate_metadata_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if !name.chars().all(|c| c.is_ascii_graphic() && c != '/') {
        return Err("name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_name_validation() {
        assert!(validate_metadata_name("nginx").is_ok());
        assert!(validate_metadata_name("kube-proxy_1.2").is_ok());
        assert!(validate_metadata_name("").is_err());
        assert!(validate_metadata_name("a/b").is_err());
        assert!(validate_metadata_name("has space").is_err());
        assert!(validate_metadata_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
