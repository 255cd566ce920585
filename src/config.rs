//! Service configuration.

use crate::constants::{
    CONTAINERS_DIR, DEFAULT_SOCKET_PATH, DEFAULT_STATE_DIR, DEFAULT_STORE_DIR, DOCKER_DOMAIN,
    KEYS_SERVER, LIBRARY_URL, SANDBOXES_DIR, SHUTDOWN_GRACE, SINGULARITY_NAME, STARTER_NAME,
    STARTERS_DIR,
};
use crate::image::RegistryEndpoints;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime shim configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Unix socket the services are served on.
    pub socket_path: PathBuf,
    /// Directory holding image artifacts and the image index.
    pub store_dir: PathBuf,
    /// Directory holding sandbox, container and starter records.
    pub state_dir: PathBuf,
    /// Starter helper executable.
    pub starter_path: PathBuf,
    /// Engine executable used for docker builds.
    pub singularity_path: PathBuf,
    /// Default registry endpoints.
    pub endpoints: RegistryEndpoints,
    /// Time in-flight requests get on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            starter_path: PathBuf::from(STARTER_NAME),
            singularity_path: PathBuf::from(SINGULARITY_NAME),
            endpoints: RegistryEndpoints {
                library: LIBRARY_URL.to_string(),
                docker: DOCKER_DOMAIN.to_string(),
                keys: KEYS_SERVER.to_string(),
            },
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted in a single scratch directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            socket_path: root.join("sycri.sock"),
            store_dir: root.join("store"),
            state_dir: root.join("state"),
            ..Self::default()
        }
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.state_dir.join(SANDBOXES_DIR)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.state_dir.join(CONTAINERS_DIR)
    }

    pub fn starters_dir(&self) -> PathBuf {
        self.state_dir.join(STARTERS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/var/run/singularity.sock"));
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/singularity"));
        assert_eq!(config.endpoints.library, "https://library.sylabs.io");
        assert_eq!(config.endpoints.keys, "https://keys.sylabs.io");
    }

    #[test]
    fn test_with_root_layout() {
        let config = RuntimeConfig::with_root("/tmp/x");
        assert_eq!(config.sandboxes_dir(), PathBuf::from("/tmp/x/state/sandboxes"));
        assert_eq!(config.starters_dir(), PathBuf::from("/tmp/x/state/starters"));
        assert_eq!(config.store_dir, PathBuf::from("/tmp/x/store"));
    }
}
