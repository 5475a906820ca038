//! Image reference parsing and registry qualification.

use std::fmt;

use cellbox_shared::errors::{CellboxError, CellboxResult};

use crate::runtime::constants::images::DEFAULT_REGISTRY;

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and validate a reference string.
    pub fn parse(image_ref: &str) -> CellboxResult<Self> {
        let invalid = |why: &str| CellboxError::Image(format!("invalid reference {image_ref:?}: {why}"));

        if image_ref.is_empty() {
            return Err(invalid("empty"));
        }
        if let Some(c) = image_ref
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@')))
        {
            return Err(invalid(&format!("unexpected character {c:?}")));
        }

        let (name, digest) = match image_ref.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') || digest.ends_with(':') {
                    return Err(invalid("malformed digest"));
                }
                (name, Some(digest.to_string()))
            }
            None => (image_ref, None),
        };

        let (registry, remainder) = if is_fully_qualified(name) {
            match name.split_once('/') {
                Some((registry, rest)) => (Some(registry.to_string()), rest),
                None => (None, name),
            }
        } else {
            (None, name)
        };

        // A ':' after the last '/' separates the tag.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        if registry
            .as_deref()
            .is_some_and(|r| r.starts_with(['.', ':']) || r.contains(".."))
        {
            return Err(invalid("malformed registry"));
        }
        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }
        if repository
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == ".." || part.starts_with('-'))
        {
            return Err(invalid("malformed repository path"));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_qualified(&self) -> bool {
        self.registry.is_some()
    }

    /// Fully qualified candidates for this reference, in lookup order.
    ///
    /// Qualified references yield only themselves. Unqualified references
    /// yield one candidate per configured registry, or a single docker.io
    /// candidate when none are configured. A missing tag becomes `latest`.
    pub fn candidates(&self, registries: &[String]) -> Vec<ImageReference> {
        let with_registry = |registry: &str| {
            let mut candidate = self.clone();
            candidate.registry = Some(registry.trim_end_matches('/').to_string());
            if candidate.tag.is_none() && candidate.digest.is_none() {
                candidate.tag = Some("latest".to_string());
            }
            candidate
        };

        match &self.registry {
            Some(registry) => vec![with_registry(registry)],
            None if registries.is_empty() => vec![with_registry(DEFAULT_REGISTRY)],
            None => registries.iter().map(|r| with_registry(r)).collect(),
        }
    }

    /// Directory-safe key for the local store.
    pub fn storage_key(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| match c {
                '/' | ':' | '@' => '_',
                c => c,
            })
            .collect()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Check if an image reference is fully qualified (contains a registry).
///
/// A reference is considered fully qualified if it contains a `/` and the
/// part before the first `/` looks like a registry hostname:
/// - Contains a `.` (e.g., `docker.io`, `ghcr.io`)
/// - Contains a `:` (e.g., `localhost:5000`)
/// - Is exactly `localhost`
fn is_fully_qualified(image_ref: &str) -> bool {
    if let Some(slash_pos) = image_ref.find('/') {
        let first_part = &image_ref[..slash_pos];
        first_part.contains('.') || first_part.contains(':') || first_part == "localhost"
    } else {
        false
    }
}
