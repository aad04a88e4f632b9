//! Transports, transport-qualified references and the copier seam.
//!
//! A transport-qualified reference has the form `<transport>:<reference>`,
//! e.g. `docker://quay.io/org/image:v1` or `oci-archive:/tmp/img.tar:name`.
//! The set of transports is closed; see [`TransportKind`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use imgflow_core::error::{ImageError, Result};
use imgflow_core::platform::PlatformSpec;

use super::archive::{ArchiveWriter, SaveFormat};
use super::reference::{is_image_id, ImageReference};

/// Supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Container registry (`docker://`)
    Docker,
    /// Docker `save`-style tarball
    DockerArchive,
    /// Local Docker daemon
    DockerDaemon,
    /// OCI image layout directory
    Oci,
    /// Tarball of an OCI image layout
    OciArchive,
    /// Directory with one manifest and its blobs
    Dir,
    /// The local image store
    ContainersStorage,
}

impl TransportKind {
    pub const ALL: [TransportKind; 7] = [
        TransportKind::Docker,
        TransportKind::DockerArchive,
        TransportKind::DockerDaemon,
        TransportKind::Oci,
        TransportKind::OciArchive,
        TransportKind::Dir,
        TransportKind::ContainersStorage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::DockerArchive => "docker-archive",
            Self::DockerDaemon => "docker-daemon",
            Self::Oci => "oci",
            Self::OciArchive => "oci-archive",
            Self::Dir => "dir",
            Self::ContainersStorage => "containers-storage",
        }
    }

    /// The transport `name` is prefixed with, if it names one.
    pub fn prefix_of(name: &str) -> Option<Self> {
        name.split_once(':')
            .and_then(|(prefix, _)| prefix.parse().ok())
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ImageError::UnknownTransport(s.to_string()))
    }
}

/// A reference qualified by its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub transport: TransportKind,
    /// Transport-specific part after `<transport>:`
    pub within: String,
}

impl ImageRef {
    /// Build a reference, validating the transport-specific part.
    pub fn new(transport: TransportKind, within: impl Into<String>) -> Result<Self> {
        let within = within.into();
        let invalid = |message: &str| ImageError::ReferenceParse {
            reference: format!("{}:{}", transport, within),
            message: message.to_string(),
        };
        match transport {
            TransportKind::Docker => {
                let name = within
                    .strip_prefix("//")
                    .ok_or_else(|| invalid("docker references must start with //"))?;
                ImageReference::parse(name)?;
            }
            TransportKind::DockerDaemon | TransportKind::ContainersStorage => {
                if within.is_empty() {
                    return Err(invalid("empty image name"));
                }
            }
            TransportKind::DockerArchive
            | TransportKind::Oci
            | TransportKind::OciArchive
            | TransportKind::Dir => {
                if within.is_empty() || within.starts_with(':') {
                    return Err(invalid("empty path"));
                }
            }
        }
        Ok(Self { transport, within })
    }

    /// Parse `<transport>:<reference>`.
    ///
    /// Returns `Ok(None)` when the prefix is not a known transport, so the
    /// caller can treat the whole string as a registry name instead.
    pub fn parse(name: &str) -> Result<Option<Self>> {
        let Some((prefix, rest)) = name.split_once(':') else {
            return Ok(None);
        };
        let Ok(kind) = prefix.parse::<TransportKind>() else {
            return Ok(None);
        };
        Self::new(kind, rest).map(Some)
    }

    /// Registry reference for a normalized image reference.
    pub fn docker(reference: &ImageReference) -> Self {
        Self {
            transport: TransportKind::Docker,
            within: format!("//{}", reference.full_reference()),
        }
    }

    /// Local store reference for a name or ID.
    pub fn storage(name: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::ContainersStorage,
            within: name.into(),
        }
    }

    /// The docker reference this points at, for transports that carry one.
    pub fn docker_reference(&self) -> Option<ImageReference> {
        match self.transport {
            TransportKind::Docker => {
                ImageReference::parse(self.within.trim_start_matches('/')).ok()
            }
            TransportKind::DockerDaemon => {
                if is_image_id(&self.within) {
                    None
                } else {
                    ImageReference::parse(&self.within).ok()
                }
            }
            TransportKind::ContainersStorage => {
                let name = self.within.rsplit(']').next().unwrap_or(&self.within);
                ImageReference::parse_canonical(name).ok()
            }
            _ => None,
        }
    }

    /// Reference to `path` with an optional image name inside it.
    ///
    /// Path and name are separated by the first `:`, so a path carrying a
    /// name may not contain one itself. `dir:` paths never carry a name.
    pub fn path(transport: TransportKind, path: &Path, image: Option<&str>) -> Result<Self> {
        let path = path.display().to_string();
        if transport == TransportKind::Dir {
            if image.is_some() {
                return Err(ImageError::InvalidInput(format!(
                    "{} references cannot name an image",
                    transport
                )));
            }
            return Self::new(transport, path);
        }
        if path.contains(':') {
            return Err(ImageError::ReferenceParse {
                reference: format!("{}:{}", transport, path),
                message: "path contains a colon".to_string(),
            });
        }
        match image {
            Some(image) => Self::new(transport, format!("{}:{}", path, image)),
            None => Self::new(transport, path),
        }
    }

    /// Split a path-based reference into path and optional image part.
    pub fn path_and_image(&self) -> (&str, Option<&str>) {
        if self.transport == TransportKind::Dir {
            return (&self.within, None);
        }
        match self.within.split_once(':') {
            Some((path, image)) if !image.is_empty() => (path, Some(image)),
            Some((path, _)) => (path, None),
            None => (&self.within, None),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport, self.within)
    }
}

/// Manifest format requested for a copy destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    DockerV2Schema2,
    Oci,
}

impl ManifestType {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::DockerV2Schema2 => "application/vnd.docker.distribution.manifest.v2+json",
            Self::Oci => "application/vnd.oci.image.manifest.v1+json",
        }
    }
}

/// Options handed to a copier.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Platform to select from multi-platform images
    pub platform: PlatformSpec,
    /// Retries after a failed registry copy
    pub max_retries: Option<u32>,
    /// Delay between retries
    pub retry_delay: Option<Duration>,
    /// Manifest format for the destination
    pub manifest_type: Option<ManifestType>,
    /// Repository tags attached to a docker-archive entry
    pub docker_archive_additional_tags: Vec<ImageReference>,
}

/// What a source reference contains, as far as naming is concerned.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    /// Digest of the image config; its hex part is the image ID
    pub config_digest: String,
    /// Names recorded in the source (repo tags or name annotations), as
    /// written there
    pub names: Vec<String>,
}

impl SourceInfo {
    /// Image ID derived from the config digest.
    pub fn image_id(&self) -> String {
        self.config_digest
            .strip_prefix("sha256:")
            .unwrap_or(&self.config_digest)
            .to_string()
    }
}

/// A single-use handle that moves image content between two references.
///
/// Handles are never shared across images and must be released with
/// [`Copier::close`] whatever the outcome of the copy.
#[async_trait]
pub trait Copier: Send {
    /// Copy `source` to `destination`, returning the manifest bytes written.
    async fn copy(&mut self, source: &ImageRef, destination: &ImageRef) -> Result<Vec<u8>>;

    /// Release the handle.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for copiers plus the transport queries the engine needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Obtain a fresh copier.
    fn new_copier(&self, options: &CopyOptions) -> Result<Box<dyn Copier>>;

    /// List the tags of a registry repository.
    async fn list_tags(&self, repository: &ImageReference) -> Result<Vec<String>>;

    /// Inspect a non-registry source for the names and ID it carries.
    async fn inspect_source(&self, source: &ImageRef) -> Result<SourceInfo>;

    /// Open an archive writer producing `path` in `format`.
    async fn new_archive_writer(
        &self,
        format: SaveFormat,
        path: &Path,
    ) -> Result<Box<dyn ArchiveWriter>>;
}
