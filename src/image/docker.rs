//! Docker registry references.
//!
//! Parsed with `oci-distribution`'s canonical [`Reference`], so `nginx`
//! normalizes to `docker.io/library/nginx:latest`. The identity drops the tag
//! so that pulls of different tags merge into one record:
//!
//! ```text
//! docker://localhost:5000/team/app:v2  ──▶  localhost_5000_team_app.sif
//! ```

use crate::constants::{
    DEFAULT_TAG, DOCKER_DOMAIN, DOCKER_PROTOCOL, IMAGE_EXTENSION, MAX_IMAGE_REF_LEN,
};
use crate::error::{Error, Result};
use oci_distribution::Reference;

/// Parsed docker reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerRef {
    reference: Reference,
}

impl DockerRef {
    /// Parses a docker reference, with or without its scheme.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidImageReference {
            reference: raw.to_string(),
            reason,
        };

        if raw.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(format!("exceeds {MAX_IMAGE_REF_LEN} bytes")));
        }
        let scheme = format!("{DOCKER_PROTOCOL}://");
        let stripped = raw.strip_prefix(&scheme).unwrap_or(raw);
        if stripped.is_empty() {
            return Err(invalid("empty reference".to_string()));
        }
        if !stripped
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
        {
            return Err(invalid("contains invalid characters".to_string()));
        }

        let reference: Reference = stripped
            .parse()
            .map_err(|e| invalid(format!("{e}")))?;
        Ok(Self { reference })
    }

    pub fn registry(&self) -> &str {
        self.reference.registry()
    }

    pub fn repository(&self) -> &str {
        self.reference.repository()
    }

    /// Remote locator, `docker://<registry>/<repository>[:tag][@digest]`.
    pub fn remote(&self) -> String {
        format!("{DOCKER_PROTOCOL}://{}", self.reference.whole())
    }

    /// Remote locator with the default registry replaced by `server`.
    ///
    /// References naming another registry explicitly are left untouched, as
    /// is everything when `server` is empty or already the registry.
    pub fn locator(&self, server: &str) -> String {
        let host = server
            .split_once("://")
            .map_or(server, |(_, host)| host)
            .trim_end_matches('/');
        if host.is_empty() || host == self.registry() || self.registry() != DOCKER_DOMAIN {
            return self.remote();
        }
        let mut locator = format!("{DOCKER_PROTOCOL}://{host}/{}", self.repository());
        if let Some(tag) = self.reference.tag() {
            locator.push(':');
            locator.push_str(tag);
        }
        if let Some(digest) = self.reference.digest() {
            locator.push('@');
            locator.push_str(digest);
        }
        locator
    }

    /// Identity: registry (with `:` as `_`) and repository segments joined by `_`.
    pub fn id(&self) -> String {
        let registry = self.registry().replace(':', "_");
        let repository = self.repository().replace('/', "_");
        format!("{registry}_{repository}{IMAGE_EXTENSION}")
    }

    pub fn tags(&self) -> Vec<String> {
        match (self.reference.tag(), self.reference.digest()) {
            (Some(tag), _) => vec![tag.to_string()],
            (None, None) => vec![DEFAULT_TAG.to_string()],
            (None, Some(_)) => Vec::new(),
        }
    }

    pub fn digests(&self) -> Vec<String> {
        self.reference
            .digest()
            .map(|digest| vec![digest.to_string()])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_short_names() {
        let r = DockerRef::parse("docker://nginx").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/nginx");
        assert_eq!(r.tags(), ["latest"]);
        assert_eq!(r.id(), "docker.io_library_nginx.sif");
        assert!(r.digests().is_empty());
    }

    #[test]
    fn test_registry_with_port() {
        let r = DockerRef::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(r.id(), "localhost_5000_team_app.sif");
        assert_eq!(r.tags(), ["v2"]);
        assert_eq!(r.remote(), "docker://localhost:5000/team/app:v2");
    }

    #[test]
    fn test_pinned_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = DockerRef::parse(&format!("quay.io/org/tool@{digest}")).unwrap();
        assert_eq!(r.digests(), [digest]);
        assert_eq!(r.id(), "quay.io_org_tool.sif");
    }

    #[test]
    fn test_locator_mirrors_default_registry() {
        let r = DockerRef::parse("nginx:1.25").unwrap();
        assert_eq!(r.locator(""), "docker://docker.io/library/nginx:1.25");
        assert_eq!(r.locator("docker.io"), "docker://docker.io/library/nginx:1.25");
        assert_eq!(
            r.locator("https://mirror.example:5000/"),
            "docker://mirror.example:5000/library/nginx:1.25"
        );
        // The identity never follows the mirror.
        assert_eq!(r.id(), "docker.io_library_nginx.sif");

        let pinned = DockerRef::parse("quay.io/org/tool:v1").unwrap();
        assert_eq!(pinned.locator("mirror.example"), "docker://quay.io/org/tool:v1");
    }

    #[test]
    fn test_rejections() {
        assert!(DockerRef::parse("docker://").is_err());
        assert!(DockerRef::parse("nginx :latest").is_err());
        assert!(DockerRef::parse("UPPER/Case").is_err());
    }
}
