//! Image reference resolution.
//!
//! A raw reference is dispatched once to a registry kind:
//!
//! | Input | Kind |
//! |-------|------|
//! | `library://...` or `cloud.sylabs.io/...` | library |
//! | `docker://...` | docker |
//! | `<domain>/...` where the first segment has `.` or `:` or is `localhost` | docker |
//! | anything else | library |

use super::docker::DockerRef;
use super::fetch::{Credentials, Endpoint, ImageFetcher};
use super::library::LibraryRef;
use crate::constants::{DOCKER_PROTOCOL, LIBRARY_DOMAIN, LIBRARY_PROTOCOL};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Registry kind of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Library,
    Docker,
}

/// Default endpoint of every registry kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEndpoints {
    /// Library server address.
    pub library: String,
    /// Docker registry domain.
    pub docker: String,
    /// Key verification server.
    pub keys: String,
}

/// Per-pull authentication override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Opaque `user:password` token.
    #[serde(default)]
    pub auth: String,
    /// Replaces the registry's default endpoint when set.
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub identity_token: String,
    #[serde(default)]
    pub registry_token: String,
}

impl AuthConfig {
    fn credentials(&self) -> Option<Credentials> {
        if !self.registry_token.is_empty() {
            return Some(Credentials::Token(self.registry_token.clone()));
        }
        if !self.identity_token.is_empty() {
            return Some(Credentials::Token(self.identity_token.clone()));
        }
        if !self.username.is_empty() {
            return Some(Credentials::Basic {
                username: self.username.clone(),
                password: self.password.clone(),
            });
        }
        self.auth.split_once(':').map(|(username, password)| Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Resolved image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Library(LibraryRef),
    Docker(DockerRef),
}

impl ImageRef {
    /// Resolves a raw reference.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidImageReference`](crate::Error::InvalidImageReference)
    /// for malformed references.
    pub fn resolve(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match registry_kind(raw) {
            RegistryKind::Library => LibraryRef::parse(raw).map(Self::Library),
            RegistryKind::Docker => DockerRef::parse(raw).map(Self::Docker),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        match self {
            Self::Library(_) => RegistryKind::Library,
            Self::Docker(_) => RegistryKind::Docker,
        }
    }

    /// Remote locator passed to the registry.
    pub fn remote(&self) -> String {
        match self {
            Self::Library(r) => r.remote().to_string(),
            Self::Docker(r) => r.remote(),
        }
    }

    /// Locator handed to the transfer for `endpoint`.
    ///
    /// Docker references on the default registry are redirected to the
    /// endpoint's server; library references carry the server separately.
    pub fn locator(&self, endpoint: &Endpoint) -> String {
        match self {
            Self::Library(r) => r.remote().to_string(),
            Self::Docker(r) => r.locator(&endpoint.server),
        }
    }

    /// Identity, also the artifact file name in the store.
    pub fn id(&self) -> String {
        match self {
            Self::Library(r) => r.id(),
            Self::Docker(r) => r.id(),
        }
    }

    pub fn tags(&self) -> Vec<String> {
        match self {
            Self::Library(r) => r.tags().to_vec(),
            Self::Docker(r) => r.tags(),
        }
    }

    pub fn digests(&self) -> Vec<String> {
        match self {
            Self::Library(_) => Vec::new(),
            Self::Docker(r) => r.digests(),
        }
    }

    /// Endpoint for this reference: the override server when set, else the default.
    pub fn endpoint(&self, endpoints: &RegistryEndpoints, auth: Option<&AuthConfig>) -> Endpoint {
        let default = match self {
            Self::Library(_) => &endpoints.library,
            Self::Docker(_) => &endpoints.docker,
        };
        let server = auth
            .map(|a| a.server_address.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(default);
        Endpoint {
            server: server.to_string(),
            credentials: auth.and_then(AuthConfig::credentials),
        }
    }

    /// Transfers the image into `dest` through `fetcher`.
    pub async fn pull(
        &self,
        fetcher: &dyn ImageFetcher,
        endpoints: &RegistryEndpoints,
        auth: Option<&AuthConfig>,
        dest: &Path,
    ) -> Result<()> {
        let endpoint = self.endpoint(endpoints, auth);
        fetcher.fetch(self, &endpoint, dest).await
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.remote())
    }
}

/// Picks the registry kind of a raw reference.
pub fn registry_kind(raw: &str) -> RegistryKind {
    if raw.starts_with(&format!("{LIBRARY_PROTOCOL}://")) {
        return RegistryKind::Library;
    }
    if raw.starts_with(&format!("{DOCKER_PROTOCOL}://")) {
        return RegistryKind::Docker;
    }
    match raw.split_once('/') {
        Some((first, _)) if first == LIBRARY_DOMAIN => RegistryKind::Library,
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            RegistryKind::Docker
        }
        _ => RegistryKind::Library,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch() {
        assert_eq!(registry_kind("library://alice/c/app"), RegistryKind::Library);
        assert_eq!(registry_kind("cloud.sylabs.io/alice/c/app"), RegistryKind::Library);
        assert_eq!(registry_kind("docker://nginx"), RegistryKind::Docker);
        assert_eq!(registry_kind("quay.io/org/tool"), RegistryKind::Docker);
        assert_eq!(registry_kind("localhost/app"), RegistryKind::Docker);
        assert_eq!(registry_kind("localhost:5000/app"), RegistryKind::Docker);
        assert_eq!(registry_kind("alice/c/app"), RegistryKind::Library);
        assert_eq!(registry_kind("app:1.0"), RegistryKind::Library);
    }

    #[test]
    fn test_endpoint_override() {
        let endpoints = RegistryEndpoints {
            library: "https://library.sylabs.io".to_string(),
            docker: "docker.io".to_string(),
            keys: "https://keys.sylabs.io".to_string(),
        };
        let image = ImageRef::resolve("alice/c/app").unwrap();
        assert_eq!(image.endpoint(&endpoints, None).server, "https://library.sylabs.io");

        let auth = AuthConfig {
            server_address: "https://lib.internal".to_string(),
            registry_token: "t0k".to_string(),
            ..AuthConfig::default()
        };
        let endpoint = image.endpoint(&endpoints, Some(&auth));
        assert_eq!(endpoint.server, "https://lib.internal");
        assert_eq!(endpoint.credentials, Some(Credentials::Token("t0k".to_string())));

        let blank = AuthConfig::default();
        assert_eq!(image.endpoint(&endpoints, Some(&blank)).server, "https://library.sylabs.io");
    }

    #[test]
    fn test_auth_token_credentials() {
        let auth = AuthConfig {
            auth: "bob:secret".to_string(),
            ..AuthConfig::default()
        };
        assert_eq!(
            auth.credentials(),
            Some(Credentials::Basic {
                username: "bob".to_string(),
                password: "secret".to_string()
            })
        );
        assert_eq!(AuthConfig::default().credentials(), None);
    }
}
