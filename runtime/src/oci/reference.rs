//! OCI image reference parsing.
//!
//! Parses image references like `quay.io/org/image:v1` into structured
//! components, normalizing short Docker Hub names the way container tooling
//! does (`nginx` → `docker.io/library/nginx:latest`).

use imgflow_core::error::{ImageError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed, normalized OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "quay.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/image")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

/// Components of a reference before any defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameParts {
    pub domain: Option<String>,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string, applying the default registry and,
    /// when neither tag nor digest is present, the default tag.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `quay.io/org/image:tag` → quay.io/org/image:tag
    /// - `quay.io/org/image@sha256:abc...` → quay.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let parts = Self::split(reference)?;

        let (registry, repository) = match parts.domain {
            Some(domain) => (domain, parts.path),
            None => (DEFAULT_REGISTRY.to_string(), parts.path),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", repository)
        } else {
            repository
        };

        let tag = if parts.tag.is_none() && parts.digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            parts.tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest: parts.digest,
        })
    }

    /// Parse a reference that must already be in its fully-qualified form
    /// (registry, repository and a tag or digest, exactly as `parse` would
    /// print it).
    pub fn parse_canonical(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        if parsed.full_reference() != reference {
            return Err(ImageError::ReferenceParse {
                reference: reference.to_string(),
                message: "reference is not fully qualified".to_string(),
            });
        }
        Ok(parsed)
    }

    /// Split a reference into its raw components without applying defaults.
    pub fn split(reference: &str) -> Result<NameParts> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(parse_error(reference, "empty image reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                validate_digest(reference, digest_part)?;
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split tag (: separator, but only after the last /)
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => (
                        &name_tag[..slash_pos + 1 + colon_pos],
                        Some(&after_slash[colon_pos + 1..]),
                    ),
                    None => (name_tag, None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos) => (&name_tag[..colon_pos], Some(&name_tag[colon_pos + 1..])),
                None => (name_tag, None),
            },
        };

        if let Some(tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (domain, path) = split_domain(name);
        validate_path(reference, path)?;

        Ok(NameParts {
            domain: domain.map(str::to_string),
            path: path.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Whether `name` lacks a registry and therefore needs short-name
    /// resolution.
    pub fn is_short_name(name: &str) -> bool {
        match Self::split(name) {
            Ok(parts) => parts.domain.is_none(),
            Err(_) => false,
        }
    }

    /// Repository name without tag or digest (e.g. "docker.io/library/nginx").
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Copy of this reference with the given tag and no digest.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        validate_tag(&self.name(), tag)?;
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// Copy of this reference with the given digest and no tag.
    pub fn with_digest(&self, digest: &str) -> Result<Self> {
        validate_digest(&self.name(), digest)?;
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        })
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Whether `name` refers to a local image by ID: either `sha256:`-prefixed
/// or a bare 64-character hex string.
pub fn is_image_id(name: &str) -> bool {
    name.starts_with("sha256:")
        || (name.len() == 64 && !name.contains(|c: char| matches!(c, '/' | '.' | ':' | '@')))
}

/// Docker compatibility: a name that is both tagged and digested
/// (`fedora:latest@sha256:...`) loses its tag; the digest wins.
pub fn normalize_tagged_digested(name: &str) -> Result<String> {
    let parts = ImageReference::split(name)?;
    match (&parts.tag, &parts.digest) {
        (Some(_), Some(digest)) => {
            let mut normalized = String::new();
            if let Some(domain) = &parts.domain {
                normalized.push_str(domain);
                normalized.push('/');
            }
            normalized.push_str(&parts.path);
            normalized.push('@');
            normalized.push_str(digest);
            tracing::debug!(name, normalized = %normalized, "Stripped tag from tagged and digested reference");
            Ok(normalized)
        }
        _ => Ok(name.trim().to_string()),
    }
}

/// Split a name into domain and path components. The first component is a
/// domain if it contains a dot or colon, or is "localhost".
fn split_domain(name: &str) -> (Option<&str>, &str) {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (Some(first), &name[slash_pos + 1..]);
        }
    }
    (None, name)
}

fn validate_path(reference: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(parse_error(reference, "empty repository"));
    }
    if path.len() == 64 && path.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(parse_error(
            reference,
            "repository name must not be a 64-byte hexadecimal string",
        ));
    }
    for component in path.split('/') {
        if component.is_empty() {
            return Err(parse_error(reference, "empty path component"));
        }
        let valid = component.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
        });
        let bounded = component
            .chars()
            .next()
            .zip(component.chars().last())
            .map_or(false, |(first, last)| {
                first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
            });
        if !valid || !bounded {
            return Err(parse_error(
                reference,
                "repository name must be lowercase alphanumerics separated by '.', '_' or '-'",
            ));
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(parse_error(reference, &format!("invalid tag {:?}", tag)))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
        _ => Err(parse_error(
            reference,
            "invalid digest format: expected algorithm:hex",
        )),
    }
}

fn parse_error(reference: &str, message: &str) -> ImageError {
    ImageError::ReferenceParse {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}
