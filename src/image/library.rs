//! Library registry references.
//!
//! Grammar:
//!
//! ```text
//! [library://][<owner>/][<collection>/]<name>[:<tag>[,<tag>...]]
//! ```
//!
//! | Segments | Owner | Collection | Name |
//! |----------|-------|------------|------|
//! | 1 | | | `seg[0]` |
//! | 2 | | `seg[0]` | `seg[1]` |
//! | 3 | `seg[0]` | `seg[1]` | `seg[2]` |
//!
//! With a single leading segment it is the collection, never the owner.

use crate::constants::{
    DEFAULT_TAG, IMAGE_EXTENSION, LIBRARY_DOMAIN, LIBRARY_PROTOCOL, LIBRARY_SEGMENT_VALID_CHARS,
    MAX_IMAGE_REF_LEN, MAX_LIBRARY_SEGMENTS,
};
use crate::error::{Error, Result};

/// Parsed library reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
    remote: String,
    owner: String,
    collection: String,
    name: String,
    tags: Vec<String>,
}

impl LibraryRef {
    /// Parses a library reference, with or without its scheme or domain.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {MAX_IMAGE_REF_LEN} bytes")));
        }

        let scheme = format!("{LIBRARY_PROTOCOL}://");
        let path = raw.strip_prefix(&scheme).unwrap_or(raw);
        let domain = format!("{LIBRARY_DOMAIN}/");
        let path = path.strip_prefix(&domain).unwrap_or(path);
        if path.is_empty() {
            return Err(invalid("empty reference"));
        }

        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() > MAX_LIBRARY_SEGMENTS {
            return Err(invalid(&format!(
                "more than {MAX_LIBRARY_SEGMENTS} path segments"
            )));
        }

        let (last, leading) = segments
            .split_last()
            .ok_or_else(|| invalid("empty reference"))?;
        let (name, tags) = match last.split_once(':') {
            Some((name, tags)) => {
                let tags: Vec<String> = tags.split(',').map(str::to_string).collect();
                (name, tags)
            }
            None => (*last, vec![DEFAULT_TAG.to_string()]),
        };

        for segment in leading.iter().copied().chain(std::iter::once(name)) {
            validate_token(segment)
                .map_err(|reason| invalid(&format!("segment '{segment}': {reason}")))?;
        }
        for tag in &tags {
            validate_token(tag).map_err(|reason| invalid(&format!("tag '{tag}': {reason}")))?;
        }

        let (owner, collection) = match leading {
            [owner, collection] => (owner.to_string(), collection.to_string()),
            [collection] => (String::new(), collection.to_string()),
            _ => (String::new(), String::new()),
        };

        Ok(Self {
            remote: format!("{scheme}{path}"),
            owner,
            collection,
            name: name.to_string(),
            tags,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote locator, `library://<path>[:<tags>]`.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Identity: non-empty owner, collection and name joined by `_`, plus `.sif`.
    pub fn id(&self) -> String {
        let parts: Vec<&str> = [self.owner.as_str(), self.collection.as_str(), self.name.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        format!("{}{IMAGE_EXTENSION}", parts.join("_"))
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Path on the library server without tags, e.g. `alice/mycol/app`.
    pub fn path(&self) -> String {
        [self.owner.as_str(), self.collection.as_str(), self.name.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn validate_token(token: &str) -> std::result::Result<(), &'static str> {
    if token.is_empty() {
        return Err("cannot be empty");
    }
    if token.starts_with('.') {
        return Err("cannot start with '.'");
    }
    if !token.chars().all(|c| LIBRARY_SEGMENT_VALID_CHARS.contains(c)) {
        return Err("contains invalid characters");
    }
    Ok(())
}
