//! Image archives: `docker-archive` and `oci-archive` tarballs.
//!
//! An [`ArchiveWriter`] hands out destination references into an archive
//! being assembled and produces the tarball on close. The default
//! [`TarArchiveWriter`] stages every entry in an OCI layout inside a
//! temporary directory; copiers write into that staging area through the
//! reference the writer returned.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use imgflow_core::error::{ImageError, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::layout::{
    digest_hex, ref_name_annotations, ref_name_of, sha256_digest, LayoutImage, OciLayout,
    CONTAINERD_NAME_ANNOTATION, REF_NAME_ANNOTATION,
};
use super::reference::ImageReference;
use super::transport::{ImageRef, ManifestType, TransportKind};

/// Output formats of `save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// OCI layout directory
    OciDir,
    /// `dir` layout with a Docker v2s2 manifest
    DockerDir,
    /// `docker save` compatible tarball
    DockerArchive,
    /// Tarball of an OCI layout
    OciArchive,
}

impl SaveFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OciDir => "oci-dir",
            Self::DockerDir => "docker-dir",
            Self::DockerArchive => "docker-archive",
            Self::OciArchive => "oci-archive",
        }
    }

    /// Whether one output may hold several images.
    pub fn supports_multiple_images(&self) -> bool {
        matches!(self, Self::DockerArchive | Self::OciArchive)
    }

    /// Manifest format written for this output.
    pub fn manifest_type(&self) -> ManifestType {
        match self {
            Self::DockerDir | Self::DockerArchive => ManifestType::DockerV2Schema2,
            Self::OciDir | Self::OciArchive => ManifestType::Oci,
        }
    }
}

impl std::fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SaveFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oci-dir" => Ok(Self::OciDir),
            "docker-dir" => Ok(Self::DockerDir),
            "docker-archive" => Ok(Self::DockerArchive),
            "oci-archive" => Ok(Self::OciArchive),
            other => Err(ImageError::InvalidInput(format!(
                "unsupported format {:?} for saving images",
                other
            ))),
        }
    }
}

/// Writer assembling one archive.
#[async_trait]
pub trait ArchiveWriter: Send {
    /// A fresh destination inside the archive, named `name` where the
    /// format records names per entry.
    fn new_reference(&mut self, name: Option<&str>) -> Result<ImageRef>;

    /// Produce the archive.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Annotation carrying the repository tags of a staged docker-archive entry.
const REPO_TAGS_ANNOTATION: &str = "io.imgflow.archive.repo-tags";
const STAGING_MARKER: &str = "imgflow-archive-staging";

/// Staging area behind a [`TarArchiveWriter`].
///
/// Entries live in an OCI layout, each under an internal ref name, in the
/// order they were added.
pub struct ArchiveStaging {
    layout: OciLayout,
}

impl ArchiveStaging {
    fn create(root: &Path) -> Result<Self> {
        let layout = OciLayout::create(root)?;
        std::fs::write(root.join(STAGING_MARKER), b"")?;
        Ok(Self { layout })
    }

    /// Open the staging area at `root`; `None` if `root` is not one.
    pub fn open(root: &Path) -> Result<Option<Self>> {
        if !root.join(STAGING_MARKER).exists() {
            return Ok(None);
        }
        Ok(Some(Self {
            layout: OciLayout::open(root)?,
        }))
    }

    /// Write `image` as entry `entry`, recording `repo_tags`.
    pub fn add(
        &self,
        source: &OciLayout,
        image: &LayoutImage,
        entry: &str,
        repo_tags: &[ImageReference],
        manifest_type: Option<ManifestType>,
    ) -> Result<Vec<u8>> {
        let mut annotations = ref_name_annotations(Some(entry));
        if !repo_tags.is_empty() {
            let tags: Vec<String> = repo_tags.iter().map(|t| t.full_reference()).collect();
            annotations.insert(REPO_TAGS_ANNOTATION.to_string(), serde_json::to_string(&tags)?);
        }
        self.layout.import(source, image, annotations, manifest_type)
    }

    /// Staged entries in insertion order: ref name, image and repo tags.
    fn entries(&self) -> Result<Vec<(String, LayoutImage, Vec<String>)>> {
        let index = self.layout.index()?;
        let mut entries = Vec::new();
        for descriptor in index.manifests() {
            let Some(entry) = ref_name_of(descriptor) else {
                continue;
            };
            let image = self.layout.load_image(Some(entry))?;
            let tags = match image.annotations.get(REPO_TAGS_ANNOTATION) {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            };
            entries.push((entry.to_string(), image, tags));
        }
        Ok(entries)
    }
}

/// `manifest.json` entry of a docker archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerArchiveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Archive writer producing a tarball at close.
pub struct TarArchiveWriter {
    format: SaveFormat,
    path: PathBuf,
    staging_dir: TempDir,
    staging: ArchiveStaging,
    /// Internal entry name → name recorded in the archive
    names: Vec<(String, Option<String>)>,
}

impl TarArchiveWriter {
    pub fn new(format: SaveFormat, path: &Path) -> Result<Self> {
        if !format.supports_multiple_images() {
            return Err(ImageError::Internal(format!(
                "no archive writer for format {}",
                format
            )));
        }
        let staging_dir = tempfile::Builder::new().prefix("imgflow-archive").tempdir()?;
        let staging = ArchiveStaging::create(staging_dir.path())?;
        Ok(Self {
            format,
            path: path.to_path_buf(),
            staging_dir,
            staging,
            names: Vec::new(),
        })
    }

    fn write_docker_archive(&self, builder: &mut tar::Builder<File>) -> Result<()> {
        let mut manifest = Vec::new();
        let mut written: HashSet<String> = HashSet::new();
        for (_, image, repo_tags) in self.staging.entries()? {
            let config_name = format!("{}.json", image.id());
            if written.insert(config_name.clone()) {
                append_bytes(builder, &config_name, &image.config_bytes)?;
            }
            let mut layers = Vec::new();
            for digest in image.layer_digests() {
                let layer_name = format!("{}.tar", digest_hex(&digest));
                if written.insert(layer_name.clone()) {
                    builder.append_path_with_name(self.staging.layout.blob_path(&digest), &layer_name)?;
                }
                layers.push(layer_name);
            }
            manifest.push(DockerArchiveEntry {
                config: config_name,
                repo_tags,
                layers,
            });
        }
        append_bytes(builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;
        Ok(())
    }

    fn write_oci_archive(&self, builder: &mut tar::Builder<File>) -> Result<()> {
        let out = OciLayout::create(self.staging_dir.path().join("out"))?;
        for (entry, image, _) in self.staging.entries()? {
            let name = self
                .names
                .iter()
                .find(|(internal, _)| *internal == entry)
                .and_then(|(_, name)| name.as_deref());
            out.import(&self.staging.layout, &image, ref_name_annotations(name), None)?;
        }
        builder.append_path_with_name(out.root().join("oci-layout"), "oci-layout")?;
        builder.append_path_with_name(out.root().join("index.json"), "index.json")?;
        builder.append_dir_all("blobs", out.root().join("blobs"))?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveWriter for TarArchiveWriter {
    fn new_reference(&mut self, name: Option<&str>) -> Result<ImageRef> {
        let entry = format!("entry-{}", self.names.len());
        self.names.push((entry.clone(), name.map(String::from)));
        let transport = match self.format {
            SaveFormat::DockerArchive => TransportKind::DockerArchive,
            _ => TransportKind::OciArchive,
        };
        ImageRef::path(transport, self.staging_dir.path(), Some(&entry))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path).map_err(|e| {
            ImageError::Archive(format!("failed to create {}: {}", tmp_path.display(), e))
        })?;
        let mut builder = tar::Builder::new(file);
        let written = match self.format {
            SaveFormat::DockerArchive => self.write_docker_archive(&mut builder),
            _ => self.write_oci_archive(&mut builder),
        }
        .and_then(|()| Ok(builder.into_inner()?.sync_all()?));

        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ImageError::Archive(format!(
                "failed to write {}: {}",
                self.path.display(),
                e
            )));
        }
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(path = %self.path.display(), format = %self.format, "Archive written");
        Ok(())
    }
}

fn append_bytes(builder: &mut tar::Builder<File>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn unpack(path: &Path) -> Result<TempDir> {
    let file = File::open(path)
        .map_err(|e| ImageError::Archive(format!("failed to open {}: {}", path.display(), e)))?;
    let dir = tempfile::Builder::new().prefix("imgflow-unpack").tempdir()?;
    tar::Archive::new(file)
        .unpack(dir.path())
        .map_err(|e| ImageError::Archive(format!("failed to unpack {}: {}", path.display(), e)))?;
    Ok(dir)
}

/// An unpacked `oci-archive`.
pub struct OciArchive {
    _dir: TempDir,
    layout: OciLayout,
}

impl OciArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let dir = unpack(path)?;
        let layout = OciLayout::open(dir.path())?;
        Ok(Self { _dir: dir, layout })
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    /// Name recorded for an entry: the containerd name, then the ref name.
    pub fn name_of(image: &LayoutImage) -> Option<String> {
        [CONTAINERD_NAME_ANNOTATION, REF_NAME_ANNOTATION]
            .iter()
            .filter_map(|key| image.annotations.get(*key))
            .find(|name| !name.is_empty())
            .cloned()
    }
}

/// An unpacked `docker-archive`.
pub struct DockerArchive {
    dir: TempDir,
    entries: Vec<DockerArchiveEntry>,
}

impl DockerArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let dir = unpack(path)?;
        let data = std::fs::read(dir.path().join("manifest.json")).map_err(|e| {
            ImageError::Archive(format!("{} has no manifest.json: {}", path.display(), e))
        })?;
        let entries: Vec<DockerArchiveEntry> = serde_json::from_slice(&data)?;
        Ok(Self { dir, entries })
    }

    /// Index of the entry `selector` refers to: `@N`, a repo tag, or the
    /// only entry when absent.
    pub fn select(&self, selector: Option<&str>) -> Result<usize> {
        match selector {
            None if self.entries.len() == 1 => Ok(0),
            None => Err(ImageError::Archive(format!(
                "archive contains {} images, one must be selected",
                self.entries.len()
            ))),
            Some(selector) => {
                if let Some(position) = selector.strip_prefix('@') {
                    let position: usize = position.parse().map_err(|_| {
                        ImageError::InvalidInput(format!("invalid archive index {:?}", selector))
                    })?;
                    return if position < self.entries.len() {
                        Ok(position)
                    } else {
                        Err(ImageError::Archive(format!("no image at index {}", position)))
                    };
                }
                let wanted = ImageReference::parse(selector)?;
                self.entries
                    .iter()
                    .position(|entry| {
                        entry.repo_tags.iter().any(|tag| {
                            ImageReference::parse(tag).map_or(false, |t| t == wanted)
                        })
                    })
                    .ok_or_else(|| {
                        ImageError::Archive(format!("no image tagged {} in archive", selector))
                    })
            }
        }
    }

    /// Repo tags of entry `position`, as written in the archive.
    pub fn repo_tags(&self, position: usize) -> &[String] {
        self.entries
            .get(position)
            .map(|entry| entry.repo_tags.as_slice())
            .unwrap_or_default()
    }

    /// Config digest of entry `position`.
    pub fn config_digest(&self, position: usize) -> Result<String> {
        let entry = self.entry(position)?;
        Ok(sha256_digest(&std::fs::read(self.dir.path().join(&entry.config))?))
    }

    /// Write entry `position` into `target` as a Docker v2s2 image.
    pub fn load_into(&self, position: usize, target: &OciLayout) -> Result<LayoutImage> {
        let entry = self.entry(position)?;
        let config_bytes = std::fs::read(self.dir.path().join(&entry.config))?;
        let config_digest = target.write_blob(&config_bytes)?;

        let mut layers = Vec::new();
        for layer in &entry.layers {
            let data = std::fs::read(self.dir.path().join(layer))?;
            let media_type = if data.starts_with(&[0x1f, 0x8b]) {
                "application/vnd.docker.image.rootfs.diff.tar.gzip"
            } else {
                "application/vnd.docker.image.rootfs.diff.tar"
            };
            let digest = target.write_blob(&data)?;
            layers.push(serde_json::json!({
                "mediaType": media_type,
                "size": data.len(),
                "digest": digest,
            }));
        }

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": ManifestType::DockerV2Schema2.media_type(),
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": config_bytes.len(),
                "digest": config_digest,
            },
            "layers": layers,
        }))?;
        target.add_manifest(&manifest, HashMap::new())?;
        LayoutImage::new(manifest, config_bytes)
    }

    fn entry(&self, position: usize) -> Result<&DockerArchiveEntry> {
        self.entries
            .get(position)
            .ok_or_else(|| ImageError::Archive(format!("no image at index {}", position)))
    }
}
