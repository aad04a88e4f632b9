//! OCI image layout and `dir` layout access.
//!
//! ```text
//! image/
//! ├── oci-layout           (layout marker)
//! ├── index.json           (image index, one entry per manifest)
//! └── blobs/sha256/        (manifests, configs and layers by digest)
//! ```
//!
//! The `dir` layout is flatter: `manifest.json`, a `version` marker and every
//! blob stored under its bare hex digest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use imgflow_core::error::{ImageError, Result};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use sha2::{Digest, Sha256};

use super::transport::ManifestType;

/// Annotation naming an entry of an OCI index.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Annotation containerd writes with the full image name.
pub const CONTAINERD_NAME_ANNOTATION: &str = "io.containerd.image.name";

const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const DIR_VERSION: &str = "Directory Transport Version: 1.1\n";

const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Hex part of a digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

/// An image loaded from a layout: the manifest plus its config.
#[derive(Debug, Clone)]
pub struct LayoutImage {
    /// Index annotations of the manifest, if it came from an OCI index
    pub annotations: HashMap<String, String>,
    pub manifest_bytes: Vec<u8>,
    pub manifest: ImageManifest,
    pub config_bytes: Vec<u8>,
}

impl LayoutImage {
    /// Parse a manifest and pair it with its config.
    pub fn new(manifest_bytes: Vec<u8>, config_bytes: Vec<u8>) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ImageError::Serialization(format!("failed to parse manifest: {}", e)))?;
        Ok(Self {
            annotations: HashMap::new(),
            manifest_bytes,
            manifest,
            config_bytes,
        })
    }

    pub fn manifest_digest(&self) -> String {
        sha256_digest(&self.manifest_bytes)
    }

    pub fn config_digest(&self) -> &str {
        self.manifest.config().digest()
    }

    /// Image ID: hex of the config digest.
    pub fn id(&self) -> String {
        digest_hex(self.config_digest()).to_string()
    }

    /// Media type declared by the manifest, OCI when absent.
    pub fn media_type(&self) -> String {
        match self.manifest.media_type() {
            Some(media_type) => media_type.to_string(),
            None => ManifestType::Oci.media_type().to_string(),
        }
    }

    /// Layer digests, bottom to top.
    pub fn layer_digests(&self) -> Vec<String> {
        self.manifest
            .layers()
            .iter()
            .map(|layer| layer.digest().to_string())
            .collect()
    }
}

/// OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open an existing layout, creating it when absent.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
        if !root.join("oci-layout").exists() {
            std::fs::write(root.join("oci-layout"), OCI_LAYOUT_MARKER)?;
        }
        let layout = Self { root };
        if !layout.root.join("index.json").exists() {
            layout.write_index(&ImageIndex::default())?;
        }
        Ok(layout)
    }

    /// Open an existing layout.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root.join(required).exists() {
                return Err(ImageError::Transport(format!(
                    "not a valid OCI layout: missing {} in {}",
                    required,
                    root.display()
                )));
            }
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root.join("blobs").join(algorithm).join(hex)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        std::fs::read(&path).map_err(|e| {
            ImageError::Transport(format!("failed to read blob {}: {}", path.display(), e))
        })
    }

    /// Store `data` as a blob, returning its digest.
    pub fn write_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok(digest)
    }

    /// Copy a blob from another layout unless already present.
    pub fn copy_blob_from(&self, other: &OciLayout, digest: &str) -> Result<()> {
        let target = self.blob_path(digest);
        if target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(other.blob_path(digest), &target).map_err(|e| {
            ImageError::Transport(format!("failed to copy blob {}: {}", digest, e))
        })?;
        Ok(())
    }

    pub fn index(&self) -> Result<ImageIndex> {
        let data = std::fs::read(self.root.join("index.json"))?;
        serde_json::from_slice(&data)
            .map_err(|e| ImageError::Serialization(format!("failed to parse index.json: {}", e)))
    }

    pub fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        std::fs::write(self.root.join("index.json"), data)?;
        Ok(())
    }

    /// Write a manifest blob and list it in the index.
    ///
    /// An existing entry with the same ref name annotation is replaced;
    /// an unannotated manifest already listed is not added twice.
    pub fn add_manifest(
        &self,
        manifest_bytes: &[u8],
        annotations: HashMap<String, String>,
    ) -> Result<String> {
        let digest = self.write_blob(manifest_bytes)?;
        let media_type = serde_json::from_slice::<serde_json::Value>(manifest_bytes)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| ManifestType::Oci.media_type().to_string());

        let mut descriptor = Descriptor::new(
            MediaType::from(media_type.as_str()),
            manifest_bytes.len() as i64,
            digest.clone(),
        );
        let ref_name = annotations.get(REF_NAME_ANNOTATION).cloned();
        if !annotations.is_empty() {
            descriptor.set_annotations(Some(annotations));
        }

        let mut index = self.index()?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|existing| match &ref_name {
                Some(name) => ref_name_of(existing) != Some(name.as_str()),
                None => existing.digest() != &digest || existing.annotations().is_some(),
            })
            .cloned()
            .collect();
        manifests.push(descriptor);
        index.set_manifests(manifests);
        self.write_index(&index)?;
        Ok(digest)
    }

    /// Load the manifest named `ref_name`, or the only one when `None`.
    pub fn load_image(&self, ref_name: Option<&str>) -> Result<LayoutImage> {
        let index = self.index()?;
        let descriptor = match ref_name {
            Some(name) => index
                .manifests()
                .iter()
                .find(|d| ref_name_of(d) == Some(name))
                .ok_or_else(|| {
                    ImageError::Transport(format!(
                        "no image named {:?} in {}",
                        name,
                        self.root.display()
                    ))
                })?,
            None => match index.manifests().as_slice() {
                [only] => only,
                [] => {
                    return Err(ImageError::Transport(format!(
                        "no manifests in {}",
                        self.root.display()
                    )))
                }
                _ => {
                    return Err(ImageError::Transport(format!(
                        "more than one image in {}, an image name is required",
                        self.root.display()
                    )))
                }
            },
        };

        let manifest_bytes = self.read_blob(descriptor.digest())?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ImageError::Serialization(format!("failed to parse manifest: {}", e)))?;
        let config_bytes = self.read_blob(manifest.config().digest())?;

        Ok(LayoutImage {
            annotations: descriptor.annotations().clone().unwrap_or_default(),
            manifest_bytes,
            manifest,
            config_bytes,
        })
    }

    /// Write `image` into this layout, copying blobs from `source`.
    ///
    /// The manifest is converted when `manifest_type` asks for a different
    /// format; the written manifest bytes are returned.
    pub fn import(
        &self,
        source: &OciLayout,
        image: &LayoutImage,
        annotations: HashMap<String, String>,
        manifest_type: Option<ManifestType>,
    ) -> Result<Vec<u8>> {
        self.copy_blob_from(source, image.config_digest())?;
        for layer in image.layer_digests() {
            self.copy_blob_from(source, &layer)?;
        }
        let manifest_bytes = match manifest_type {
            Some(target) => convert_manifest(&image.manifest_bytes, target)?,
            None => image.manifest_bytes.clone(),
        };
        self.add_manifest(&manifest_bytes, annotations)?;
        Ok(manifest_bytes)
    }
}

/// Annotations naming an index entry `name`, empty for `None`.
pub fn ref_name_annotations(name: Option<&str>) -> HashMap<String, String> {
    name.map(|name| HashMap::from([(REF_NAME_ANNOTATION.to_string(), name.to_string())]))
        .unwrap_or_default()
}

/// The ref name annotation of an index entry.
pub fn ref_name_of(descriptor: &Descriptor) -> Option<&str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(String::as_str)
}

/// Write `image` as a `dir` layout at `dest`.
pub fn write_dir(
    dest: &Path,
    source: &OciLayout,
    image: &LayoutImage,
    manifest_type: Option<ManifestType>,
) -> Result<Vec<u8>> {
    std::fs::create_dir_all(dest)?;
    let mut blobs = vec![image.config_digest().to_string()];
    blobs.extend(image.layer_digests());
    for digest in blobs {
        std::fs::copy(source.blob_path(&digest), dest.join(digest_hex(&digest)))?;
    }
    let manifest_bytes = match manifest_type {
        Some(target) => convert_manifest(&image.manifest_bytes, target)?,
        None => image.manifest_bytes.clone(),
    };
    std::fs::write(dest.join("manifest.json"), &manifest_bytes)?;
    std::fs::write(dest.join("version"), DIR_VERSION)?;
    Ok(manifest_bytes)
}

/// Read a `dir` layout into `target`, returning the image.
pub fn read_dir(dir: &Path, target: &OciLayout) -> Result<LayoutImage> {
    let manifest_bytes = std::fs::read(dir.join("manifest.json")).map_err(|e| {
        ImageError::Transport(format!(
            "failed to read {}: {}",
            dir.join("manifest.json").display(),
            e
        ))
    })?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| ImageError::Serialization(format!("failed to parse manifest: {}", e)))?;

    let mut blobs = vec![manifest.config().digest().to_string()];
    blobs.extend(manifest.layers().iter().map(|l| l.digest().to_string()));
    for digest in &blobs {
        let path = target.blob_path(digest);
        if !path.exists() {
            std::fs::copy(dir.join(digest_hex(digest)), &path).map_err(|e| {
                ImageError::Transport(format!("failed to read blob {}: {}", digest, e))
            })?;
        }
    }
    let config_bytes = target.read_blob(manifest.config().digest())?;
    LayoutImage::new(manifest_bytes, config_bytes)
}

/// Rewrite the media types of a manifest for `target`.
///
/// Returns the input unchanged when it already has the target type.
pub fn convert_manifest(manifest_bytes: &[u8], target: ManifestType) -> Result<Vec<u8>> {
    let mut manifest: serde_json::Value = serde_json::from_slice(manifest_bytes)?;
    let current = manifest
        .get("mediaType")
        .and_then(|m| m.as_str())
        .unwrap_or(ManifestType::Oci.media_type());
    if current == target.media_type() {
        return Ok(manifest_bytes.to_vec());
    }

    let (config_type, layer_map): (&str, &[(&str, &str)]) = match target {
        ManifestType::DockerV2Schema2 => (
            DOCKER_CONFIG,
            &[(OCI_LAYER_GZIP, DOCKER_LAYER_GZIP), (OCI_LAYER, DOCKER_LAYER)],
        ),
        ManifestType::Oci => (
            OCI_CONFIG,
            &[(DOCKER_LAYER_GZIP, OCI_LAYER_GZIP), (DOCKER_LAYER, OCI_LAYER)],
        ),
    };

    manifest["mediaType"] = target.media_type().into();
    manifest["config"]["mediaType"] = config_type.into();
    if let Some(layers) = manifest.get_mut("layers").and_then(|l| l.as_array_mut()) {
        for layer in layers {
            let media_type = layer
                .get("mediaType")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            let converted = layer_map
                .iter()
                .find(|(from, to)| *from == media_type || *to == media_type)
                .map(|(_, to)| *to)
                .ok_or_else(|| {
                    ImageError::Transport(format!(
                        "cannot convert layer media type {:?} to {}",
                        media_type,
                        target.media_type()
                    ))
                })?;
            layer["mediaType"] = converted.into();
        }
    }
    Ok(serde_json::to_vec(&manifest)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a one-layer image in `layout`, distinguished by `seed`.
    pub(crate) fn write_test_image(
        layout: &OciLayout,
        seed: &str,
        os: &str,
        arch: &str,
        ref_name: Option<&str>,
    ) -> LayoutImage {
        let layer = format!("layer-{}", seed).into_bytes();
        let layer_digest = layout.write_blob(&layer).unwrap();
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": arch,
            "os": os,
            "rootfs": { "type": "layers", "diff_ids": [layer_digest] },
            "config": { "Labels": { "seed": seed } }
        }))
        .unwrap();
        let config_digest = layout.write_blob(&config).unwrap();
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": { "mediaType": OCI_CONFIG, "digest": config_digest, "size": config.len() },
            "layers": [
                { "mediaType": OCI_LAYER_GZIP, "digest": layer_digest, "size": layer.len() }
            ]
        }))
        .unwrap();
        layout
            .add_manifest(&manifest, ref_name_annotations(ref_name))
            .unwrap();
        LayoutImage::new(manifest, config).unwrap()
    }

    const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    #[test]
    fn test_create_and_open() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("layout");
        OciLayout::create(&root).unwrap();
        assert!(root.join("oci-layout").exists());
        assert!(OciLayout::open(&root).unwrap().index().unwrap().manifests().is_empty());
    }

    #[test]
    fn test_open_rejects_non_layout() {
        let tmp = TempDir::new().unwrap();
        assert!(OciLayout::open(tmp.path()).is_err());
    }

    #[test]
    fn test_load_by_ref_name() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let a = write_test_image(&layout, "a", "linux", "amd64", Some("a"));
        let b = write_test_image(&layout, "b", "linux", "amd64", Some("b"));

        assert_eq!(layout.load_image(Some("b")).unwrap().id(), b.id());
        assert_eq!(layout.load_image(Some("a")).unwrap().id(), a.id());
        assert!(layout.load_image(Some("c")).is_err());
        assert!(layout.load_image(None).is_err());
    }

    #[test]
    fn test_add_manifest_replaces_same_name() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        write_test_image(&layout, "a", "linux", "amd64", Some("app"));
        let b = write_test_image(&layout, "b", "linux", "amd64", Some("app"));

        assert_eq!(layout.index().unwrap().manifests().len(), 1);
        assert_eq!(layout.load_image(Some("app")).unwrap().id(), b.id());
    }

    #[test]
    fn test_id_is_config_digest_hex() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let image = write_test_image(&layout, "a", "linux", "amd64", None);
        assert_eq!(image.id(), digest_hex(&sha256_digest(&image.config_bytes)));
        assert_eq!(image.id().len(), 64);
    }

    #[test]
    fn test_convert_manifest_to_docker() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path()).unwrap();
        let image = write_test_image(&layout, "a", "linux", "amd64", None);

        let docker = convert_manifest(&image.manifest_bytes, ManifestType::DockerV2Schema2).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&docker).unwrap();
        assert_eq!(value["mediaType"], ManifestType::DockerV2Schema2.media_type());
        assert_eq!(value["config"]["mediaType"], DOCKER_CONFIG);
        assert_eq!(value["layers"][0]["mediaType"], DOCKER_LAYER_GZIP);

        let same = convert_manifest(&image.manifest_bytes, ManifestType::Oci).unwrap();
        assert_eq!(same, image.manifest_bytes);
    }

    #[test]
    fn test_dir_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("src")).unwrap();
        let image = write_test_image(&layout, "a", "linux", "amd64", None);

        let dir = tmp.path().join("dir");
        write_dir(&dir, &layout, &image, None).unwrap();
        assert!(dir.join("version").exists());

        let target = OciLayout::create(tmp.path().join("dst")).unwrap();
        let read = read_dir(&dir, &target).unwrap();
        assert_eq!(read.id(), image.id());
        assert!(target.has_blob(image.config_digest()));
    }
}
