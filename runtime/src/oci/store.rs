//! Local image store.
//!
//! [`LocalStore`] is the contract the pull engine and the export assembler
//! rely on. [`DiskStore`] implements it on disk: a persistent `index.json`
//! listing every image, and one OCI layout per image under `images/<id>/`.
//! The image ID is the hex digest of the image config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgflow_core::error::{ImageError, Result};
use imgflow_core::platform::PlatformSpec;
use oci_spec::image::{ImageConfiguration, ImageIndex};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::layout::{digest_hex, sha256_digest, LayoutImage, OciLayout};
use super::reference::{ImageReference, DEFAULT_TAG};
use super::registry::RegistryClient;
use crate::image::SystemContext;

/// Result of a store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// Image ID (hex config digest)
    pub id: String,
    /// Name the lookup matched, fully qualified; the ID (prefix) when
    /// looked up by ID
    pub resolved_name: String,
    /// Manifest digests known for this image
    pub digests: Vec<String>,
}

impl LocalImage {
    /// Whether the lookup matched by (a prefix of) the image ID.
    pub fn found_by_id(&self) -> bool {
        self.id.starts_with(self.resolved_name.trim_start_matches("sha256:"))
    }
}

/// Platform constraints for a lookup. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupOptions {
    pub platform: PlatformSpec,
}

/// Local image store contract.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Find the image `name` refers to. `ImageUnknown` when there is none.
    async fn lookup(&self, name: &str, options: &LookupOptions) -> Result<LocalImage>;

    /// Integrity check; an error means the image is corrupted.
    async fn verify(&self, image: &LocalImage) -> Result<()>;

    /// Whether `candidate` currently resolves to content other than `image`.
    async fn digest_differs(
        &self,
        image: &LocalImage,
        candidate: &ImageReference,
        context: &SystemContext,
    ) -> Result<bool>;

    /// ID of the image stored for a `repo@digest` reference.
    async fn image_id_for_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Raw config blob of an image.
    async fn config_blob(&self, id: &str) -> Result<Vec<u8>>;
}

/// Index entry for a stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Hex config digest
    pub id: String,
    /// Fully-qualified names; unique across the store
    pub names: Vec<String>,
    /// Manifest digests this image was stored under
    pub digests: Vec<String>,
    /// When the image was last committed
    pub pulled_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// On-disk store.
pub struct DiskStore {
    root: PathBuf,
    index: RwLock<Vec<StoredImage>>,
    registry: Arc<RegistryClient>,
}

impl DiskStore {
    /// Open the store at `root`, creating it if needed.
    pub fn open(root: &Path, registry: Arc<RegistryClient>) -> Result<Self> {
        std::fs::create_dir_all(root.join("images")).map_err(|e| {
            ImageError::Store(format!(
                "failed to create image store {}: {}",
                root.display(),
                e
            ))
        })?;
        std::fs::create_dir_all(root.join("tmp"))?;

        let index_path = root.join("index.json");
        let images = if index_path.exists() {
            let data = std::fs::read_to_string(&index_path)?;
            let index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
                ImageError::Store(format!("failed to parse {}: {}", index_path.display(), e))
            })?;
            // Entries whose layout vanished are dropped
            index
                .images
                .into_iter()
                .filter(|image| root.join("images").join(&image.id).exists())
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            index: RwLock::new(images),
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    /// Scratch directory on the store's filesystem.
    pub fn staging_dir(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::TempDir::new_in(self.root.join("tmp"))?)
    }

    /// Layout holding image `id`.
    pub fn layout(&self, id: &str) -> Result<OciLayout> {
        OciLayout::open(self.root.join("images").join(id))
    }

    /// Layout and manifest of image `id`.
    pub fn load(&self, id: &str) -> Result<(OciLayout, LayoutImage)> {
        let layout = self.layout(id)?;
        let image = layout.load_image(None)?;
        Ok((layout, image))
    }

    /// All stored images, in commit order.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.index.read().await.clone()
    }

    /// Store `image` from `source` and optionally name it.
    ///
    /// A name already carried by another image moves to this one.
    pub async fn commit(
        &self,
        source: &OciLayout,
        image: &LayoutImage,
        name: Option<&str>,
        extra_digests: &[String],
    ) -> Result<StoredImage> {
        let id = image.id();
        let target = OciLayout::create(self.root.join("images").join(&id))?;
        target.write_index(&ImageIndex::default())?;
        let manifest_bytes = target.import(source, image, Default::default(), None)?;

        let mut digests = vec![sha256_digest(&manifest_bytes)];
        digests.extend(extra_digests.iter().cloned());

        let mut index = self.index.write().await;
        if let Some(name) = name {
            for other in index.iter_mut().filter(|other| other.id != id) {
                other.names.retain(|n| n != name);
            }
        }
        let position = match index.iter().position(|stored| stored.id == id) {
            Some(position) => position,
            None => {
                index.push(StoredImage {
                    id: id.clone(),
                    names: Vec::new(),
                    digests: Vec::new(),
                    pulled_at: Utc::now(),
                });
                index.len() - 1
            }
        };
        let stored = &mut index[position];
        stored.pulled_at = Utc::now();
        for digest in digests {
            if !stored.digests.contains(&digest) {
                stored.digests.push(digest);
            }
        }
        if let Some(name) = name {
            if !stored.names.iter().any(|n| n == name) {
                stored.names.push(name.to_string());
            }
        }
        let stored = stored.clone();
        self.save_index(&index).await?;

        tracing::debug!(id = %stored.id, name = ?name, "Committed image to store");
        Ok(stored)
    }

    async fn save_index(&self, images: &[StoredImage]) -> Result<()> {
        let data = serde_json::to_string_pretty(&StoreIndex {
            images: images.to_vec(),
        })?;
        let index_path = self.root.join("index.json");
        let tmp_path = index_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            ImageError::Store(format!(
                "failed to write {}: {}",
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Images `name` may refer to, best match first, with the name matched.
    fn candidates(images: &[StoredImage], name: &str) -> Result<Vec<(StoredImage, String)>> {
        if let Some(hex) = name.strip_prefix("sha256:") {
            if hex.is_empty() {
                return Err(ImageError::ImageUnknown(name.to_string()));
            }
            return Ok(Self::by_id_prefix(images, hex)?
                .map(|image| vec![(image, hex.to_string())])
                .unwrap_or_default());
        }
        if name.len() >= 3 && name.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Some(image) = Self::by_id_prefix(images, name)? {
                return Ok(vec![(image, name.to_string())]);
            }
        }

        let parts = ImageReference::split(name)?;
        let mut wanted = Vec::new();
        if parts.domain.is_none() {
            wanted.push(ImageReference::parse(&format!("localhost/{}", name))?);
        }
        wanted.push(ImageReference::parse(name)?);

        let mut found: Vec<(StoredImage, String)> = Vec::new();
        let mut push = |image: &StoredImage, resolved: String| {
            if !found.iter().any(|(i, _)| i.id == image.id) {
                found.push((image.clone(), resolved));
            }
        };

        for reference in &wanted {
            for image in images {
                if let Some(resolved) = Self::match_reference(image, reference, |stored| {
                    stored.name() == reference.name()
                }) {
                    push(image, resolved);
                }
            }
        }

        // Short names also match any repository ending in the same path
        if parts.domain.is_none() {
            let suffix = format!("/{}", parts.path);
            let tag = parts.tag.clone().or_else(|| {
                parts.digest.is_none().then(|| DEFAULT_TAG.to_string())
            });
            let reference = ImageReference {
                registry: String::new(),
                repository: parts.path.clone(),
                tag,
                digest: parts.digest.clone(),
            };
            for image in images {
                if let Some(resolved) = Self::match_reference(image, &reference, |stored| {
                    stored.name().ends_with(&suffix)
                }) {
                    push(image, resolved);
                }
            }
        }

        Ok(found)
    }

    /// The stored name of `image` matching `reference`'s tag or digest,
    /// restricted to repositories accepted by `same_repository`.
    fn match_reference(
        image: &StoredImage,
        reference: &ImageReference,
        same_repository: impl Fn(&ImageReference) -> bool,
    ) -> Option<String> {
        image.names.iter().find_map(|stored_name| {
            let stored = ImageReference::parse(stored_name).ok()?;
            if !same_repository(&stored) {
                return None;
            }
            match (&reference.digest, &reference.tag) {
                (Some(digest), _) => image
                    .digests
                    .contains(digest)
                    .then(|| format!("{}@{}", stored.name(), digest)),
                (None, tag) => (stored.tag == *tag).then(|| stored_name.clone()),
            }
        })
    }

    fn by_id_prefix(images: &[StoredImage], prefix: &str) -> Result<Option<StoredImage>> {
        let mut matches = images.iter().filter(|image| image.id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(image), None) => Ok(Some(image.clone())),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(ImageError::InvalidInput(format!(
                "image ID prefix {:?} is ambiguous",
                prefix
            ))),
        }
    }

    fn matches_platform(&self, id: &str, wanted: &PlatformSpec) -> Result<bool> {
        if wanted.is_empty() {
            return Ok(true);
        }
        let (_, image) = self.load(id)?;
        let config: ImageConfiguration = serde_json::from_slice(&image.config_bytes)
            .map_err(|e| ImageError::Store(format!("failed to parse config of {}: {}", id, e)))?;
        let actual = PlatformSpec::new(
            config.os().to_string(),
            config.architecture().to_string(),
            config.variant().clone().unwrap_or_default(),
        )
        .normalized();
        let wanted = wanted.normalized();

        Ok((wanted.os.is_empty() || wanted.os == actual.os)
            && (wanted.architecture.is_empty() || wanted.architecture == actual.architecture)
            && (wanted.variant.is_empty() || wanted.variant == actual.variant))
    }
}

#[async_trait]
impl LocalStore for DiskStore {
    async fn lookup(&self, name: &str, options: &LookupOptions) -> Result<LocalImage> {
        let images = self.index.read().await.clone();
        for (image, resolved_name) in Self::candidates(&images, name)? {
            if !self.matches_platform(&image.id, &options.platform)? {
                tracing::debug!(
                    id = %image.id,
                    platform = %options.platform,
                    "Local image does not match requested platform"
                );
                continue;
            }
            return Ok(LocalImage {
                id: image.id,
                resolved_name,
                digests: image.digests,
            });
        }
        Err(ImageError::ImageUnknown(name.to_string()))
    }

    async fn verify(&self, image: &LocalImage) -> Result<()> {
        let corrupted = |message: String| {
            ImageError::Store(format!("image {} is corrupted: {}", image.id, message))
        };
        let layout = self.layout(&image.id).map_err(|e| corrupted(e.to_string()))?;
        let index = layout.index().map_err(|e| corrupted(e.to_string()))?;
        let descriptor = index
            .manifests()
            .first()
            .ok_or_else(|| corrupted("no manifest".to_string()))?;
        let loaded = layout.load_image(None).map_err(|e| corrupted(e.to_string()))?;

        if &loaded.manifest_digest() != descriptor.digest() {
            return Err(corrupted("manifest digest mismatch".to_string()));
        }
        if sha256_digest(&loaded.config_bytes) != loaded.config_digest()
            || digest_hex(loaded.config_digest()) != image.id
        {
            return Err(corrupted("config digest mismatch".to_string()));
        }
        for layer in loaded.manifest.layers() {
            let size = std::fs::metadata(layout.blob_path(layer.digest()))
                .map(|m| m.len() as i64)
                .map_err(|_| corrupted(format!("layer {} is missing", layer.digest())))?;
            if size != layer.size() {
                return Err(corrupted(format!(
                    "layer {} has size {}, expected {}",
                    layer.digest(),
                    size,
                    layer.size()
                )));
            }
        }
        Ok(())
    }

    async fn digest_differs(
        &self,
        image: &LocalImage,
        candidate: &ImageReference,
        context: &SystemContext,
    ) -> Result<bool> {
        let remote = self
            .registry
            .manifest_digest(candidate, &context.platform)
            .await?;
        tracing::debug!(candidate = %candidate, remote = %remote, "Comparing digests");
        Ok(!image.digests.contains(&remote))
    }

    async fn image_id_for_digest(&self, reference: &ImageReference) -> Result<String> {
        let digest = reference.digest.as_deref().ok_or_else(|| {
            ImageError::InvalidInput(format!("{} is not a digest reference", reference))
        })?;
        let images = self.index.read().await;
        let mut with_digest = images.iter().filter(|image| image.digests.iter().any(|d| d == digest));
        let first = with_digest.clone().next();
        with_digest
            .find(|image| {
                image.names.iter().any(|n| {
                    ImageReference::parse(n).map_or(false, |r| r.name() == reference.name())
                })
            })
            .or(first)
            .map(|image| image.id.clone())
            .ok_or_else(|| ImageError::ImageUnknown(reference.to_string()))
    }

    async fn config_blob(&self, id: &str) -> Result<Vec<u8>> {
        Ok(self.load(id)?.1.config_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::tests::write_test_image;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: DiskStore,
        source: OciLayout,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(&tmp.path().join("store"), Arc::new(RegistryClient::default()))
            .unwrap();
        let source = OciLayout::create(tmp.path().join("source")).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            source,
        }
    }

    impl Fixture {
        async fn add(&self, seed: &str, arch: &str, name: Option<&str>) -> StoredImage {
            let image = write_test_image(&self.source, seed, "linux", arch, None);
            self.store.commit(&self.source, &image, name, &[]).await.unwrap()
        }
    }

    fn any() -> LookupOptions {
        LookupOptions::default()
    }

    #[tokio::test]
    async fn test_lookup_by_full_name() {
        let f = fixture();
        let stored = f.add("a", "amd64", Some("quay.io/org/app:v1")).await;

        let image = f.store.lookup("quay.io/org/app:v1", &any()).await.unwrap();
        assert_eq!(image.id, stored.id);
        assert_eq!(image.resolved_name, "quay.io/org/app:v1");
        assert!(!image.found_by_id());

        let err = f.store.lookup("quay.io/org/app:v2", &any()).await.unwrap_err();
        assert!(err.is_image_unknown());
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_prefix() {
        let f = fixture();
        let stored = f.add("a", "amd64", Some("quay.io/org/app:v1")).await;

        let by_id = f.store.lookup(&stored.id, &any()).await.unwrap();
        assert!(by_id.found_by_id());

        let prefixed = format!("sha256:{}", &stored.id[..12]);
        let by_prefix = f.store.lookup(&prefixed, &any()).await.unwrap();
        assert_eq!(by_prefix.id, stored.id);
        assert!(by_prefix.found_by_id());
    }

    #[tokio::test]
    async fn test_lookup_empty_id_prefix() {
        let f = fixture();
        f.add("a", "amd64", Some("quay.io/org/app:v1")).await;

        let err = f.store.lookup("sha256:", &any()).await.unwrap_err();
        assert!(err.is_image_unknown());
    }

    #[tokio::test]
    async fn test_lookup_short_names() {
        let f = fixture();
        let hub = f.add("hub", "amd64", Some("docker.io/library/alpine:latest")).await;
        let quay = f.add("quay", "amd64", Some("quay.io/org/tool:1.0")).await;
        let local = f.add("local", "amd64", Some("localhost/mine:latest")).await;

        assert_eq!(f.store.lookup("alpine", &any()).await.unwrap().id, hub.id);
        assert_eq!(f.store.lookup("tool:1.0", &any()).await.unwrap().id, quay.id);
        assert_eq!(f.store.lookup("org/tool:1.0", &any()).await.unwrap().id, quay.id);
        assert_eq!(f.store.lookup("mine", &any()).await.unwrap().id, local.id);
        assert!(f.store.lookup("tool", &any()).await.unwrap_err().is_image_unknown());
    }

    #[tokio::test]
    async fn test_lookup_by_digest() {
        let f = fixture();
        let stored = f.add("a", "amd64", Some("quay.io/org/app:v1")).await;
        let digest = stored.digests[0].clone();

        let name = format!("quay.io/org/app@{}", digest);
        let image = f.store.lookup(&name, &any()).await.unwrap();
        assert_eq!(image.id, stored.id);
        assert_eq!(image.resolved_name, name);
    }

    #[tokio::test]
    async fn test_lookup_platform_filter() {
        let f = fixture();
        f.add("a", "arm64", Some("quay.io/org/app:v1")).await;

        let amd = LookupOptions {
            platform: PlatformSpec::new("", "amd64", ""),
        };
        assert!(f.store.lookup("quay.io/org/app:v1", &amd).await.unwrap_err().is_image_unknown());

        let arm = LookupOptions {
            platform: PlatformSpec::new("linux", "aarch64", ""),
        };
        assert!(f.store.lookup("quay.io/org/app:v1", &arm).await.is_ok());
    }

    #[tokio::test]
    async fn test_ambiguous_id_prefix() {
        let f = fixture();
        let mut ids = Vec::new();
        for seed in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r"] {
            ids.push(f.add(seed, "amd64", None).await.id);
        }
        // With 18 images, two share a first hex digit
        let shared = ids
            .iter()
            .find(|id| ids.iter().filter(|other| other[..1] == id[..1]).count() > 1)
            .unwrap();
        let err = f.store.lookup(&format!("sha256:{}", &shared[..1]), &any()).await.unwrap_err();
        assert!(matches!(err, ImageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_commit_moves_name() {
        let f = fixture();
        let first = f.add("a", "amd64", Some("quay.io/org/app:v1")).await;
        let second = f.add("b", "amd64", Some("quay.io/org/app:v1")).await;

        let image = f.store.lookup("quay.io/org/app:v1", &any()).await.unwrap();
        assert_eq!(image.id, second.id);
        let images = f.store.list().await;
        let old = images.iter().find(|i| i.id == first.id).unwrap();
        assert!(old.names.is_empty());
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let source = OciLayout::create(tmp.path().join("source")).unwrap();
        let image = write_test_image(&source, "a", "linux", "amd64", None);
        {
            let store = DiskStore::open(&root, Arc::new(RegistryClient::default())).unwrap();
            store.commit(&source, &image, Some("quay.io/org/app:v1"), &[]).await.unwrap();
        }
        let store = DiskStore::open(&root, Arc::new(RegistryClient::default())).unwrap();
        let found = store.lookup("quay.io/org/app:v1", &any()).await.unwrap();
        assert_eq!(found.id, image.id());
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let f = fixture();
        let stored = f.add("a", "amd64", Some("quay.io/org/app:v1")).await;
        let image = f.store.lookup("quay.io/org/app:v1", &any()).await.unwrap();
        f.store.verify(&image).await.unwrap();

        let (layout, loaded) = f.store.load(&stored.id).unwrap();
        let layer = loaded.layer_digests()[0].clone();
        std::fs::write(layout.blob_path(&layer), b"truncated").unwrap();
        assert!(f.store.verify(&image).await.is_err());
    }

    #[tokio::test]
    async fn test_image_id_for_digest() {
        let f = fixture();
        let stored = f
            .store
            .commit(
                &f.source,
                &write_test_image(&f.source, "a", "linux", "amd64", None),
                Some("quay.io/org/app:v1"),
                &["sha256:feedface".to_string()],
            )
            .await
            .unwrap();

        let reference = ImageReference::parse("quay.io/org/app:v1")
            .unwrap()
            .with_digest(&stored.digests[0])
            .unwrap();
        assert_eq!(f.store.image_id_for_digest(&reference).await.unwrap(), stored.id);

        let unknown = ImageReference::parse("quay.io/org/app:v1")
            .unwrap()
            .with_digest(&format!("sha256:{}", "0".repeat(64)))
            .unwrap();
        assert!(f.store.image_id_for_digest(&unknown).await.unwrap_err().is_image_unknown());
    }

    #[tokio::test]
    async fn test_config_blob() {
        let f = fixture();
        let stored = f.add("a", "amd64", None).await;
        let config = f.store.config_blob(&stored.id).await.unwrap();
        assert_eq!(digest_hex(&sha256_digest(&config)), stored.id);
    }
}
