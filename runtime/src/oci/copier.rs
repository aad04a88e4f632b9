//! Default transport: moves images between registries, layouts, archives
//! and the [`DiskStore`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgflow_core::error::{ImageError, Result};
use oci_spec::image::ImageManifest;

use super::archive::{ArchiveStaging, ArchiveWriter, DockerArchive, OciArchive, SaveFormat, TarArchiveWriter};
use super::layout::{read_dir, ref_name_annotations, write_dir, LayoutImage, OciLayout};
use super::reference::{is_image_id, ImageReference};
use super::registry::RegistryClient;
use super::store::{DiskStore, LocalStore, LookupOptions};
use super::transport::{CopyOptions, Copier, ImageRef, SourceInfo, Transport, TransportKind};

/// Delay between registry retries when none is configured.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// [`Transport`] backed by a [`DiskStore`] and its registry client.
pub struct DefaultTransport {
    store: Arc<DiskStore>,
}

impl DefaultTransport {
    pub fn new(store: Arc<DiskStore>) -> Self {
        Self { store }
    }

    fn registry(&self) -> &RegistryClient {
        self.store.registry()
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    fn new_copier(&self, options: &CopyOptions) -> Result<Box<dyn Copier>> {
        Ok(Box::new(LocalCopier {
            store: self.store.clone(),
            options: options.clone(),
            copies: 0,
        }))
    }

    async fn list_tags(&self, repository: &ImageReference) -> Result<Vec<String>> {
        self.registry().list_tags(repository).await
    }

    async fn inspect_source(&self, source: &ImageRef) -> Result<SourceInfo> {
        let (path, image) = source.path_and_image();
        match source.transport {
            TransportKind::Oci => {
                let loaded = OciLayout::open(path)?.load_image(image)?;
                Ok(SourceInfo {
                    config_digest: loaded.config_digest().to_string(),
                    names: Vec::new(),
                })
            }
            TransportKind::OciArchive => {
                let archive = OciArchive::open(Path::new(path))?;
                let loaded = archive.layout().load_image(image)?;
                Ok(SourceInfo {
                    config_digest: loaded.config_digest().to_string(),
                    names: OciArchive::name_of(&loaded).into_iter().collect(),
                })
            }
            TransportKind::DockerArchive => {
                let archive = DockerArchive::open(Path::new(path))?;
                let position = archive.select(image)?;
                Ok(SourceInfo {
                    config_digest: archive.config_digest(position)?,
                    names: archive.repo_tags(position).to_vec(),
                })
            }
            TransportKind::Dir => {
                let manifest_path = Path::new(&source.within).join("manifest.json");
                let data = std::fs::read(&manifest_path).map_err(|e| {
                    ImageError::Transport(format!(
                        "failed to read {}: {}",
                        manifest_path.display(),
                        e
                    ))
                })?;
                let manifest: ImageManifest = serde_json::from_slice(&data)?;
                Ok(SourceInfo {
                    config_digest: manifest.config().digest().to_string(),
                    names: Vec::new(),
                })
            }
            TransportKind::ContainersStorage => {
                let local = self
                    .store
                    .lookup(&source.within, &LookupOptions::default())
                    .await?;
                Ok(SourceInfo {
                    config_digest: format!("sha256:{}", local.id),
                    names: Vec::new(),
                })
            }
            TransportKind::Docker | TransportKind::DockerDaemon => Err(ImageError::Transport(
                format!("inspecting {} sources is not supported", source.transport),
            )),
        }
    }

    async fn new_archive_writer(
        &self,
        format: SaveFormat,
        path: &Path,
    ) -> Result<Box<dyn ArchiveWriter>> {
        Ok(Box::new(TarArchiveWriter::new(format, path)?))
    }
}

/// Copier handed out by [`DefaultTransport`].
pub struct LocalCopier {
    store: Arc<DiskStore>,
    options: CopyOptions,
    copies: usize,
}

impl LocalCopier {
    /// Pull from a registry into the store, retrying failed attempts.
    async fn copy_from_registry(&self, source: &ImageRef, name: Option<&str>) -> Result<Vec<u8>> {
        let reference = source.docker_reference().ok_or_else(|| ImageError::ReferenceParse {
            reference: source.to_string(),
            message: "not a registry reference".to_string(),
        })?;
        let max_retries = self.options.max_retries.unwrap_or(0);
        let delay = self.options.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY);

        let mut attempt = 0;
        let (pulled, image, layout, _staging) = loop {
            let staging = self.store.staging_dir()?;
            let layout = OciLayout::create(staging.path())?;
            match self
                .store
                .registry()
                .pull_to_layout(&reference, &self.options.platform, &layout)
                .await
            {
                Ok(pulled) => {
                    let image = layout.load_image(None)?;
                    break (pulled, image, layout, staging);
                }
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        source = %source,
                        attempt,
                        max_retries,
                        error = %e,
                        "Failed to pull image, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ImageError::Transport(format!(
                        "initializing source {}: {}",
                        source, e
                    )))
                }
            }
        };

        self.store
            .commit(&layout, &image, name, &[pulled.registry_digest])
            .await?;
        Ok(pulled.manifest_bytes)
    }

    /// Import `image` from a scratch layout into the store.
    async fn import(&self, layout: &OciLayout, image: &LayoutImage, name: Option<&str>) -> Result<Vec<u8>> {
        self.store.commit(layout, image, name, &[]).await?;
        Ok(image.manifest_bytes.clone())
    }

    async fn copy_to_store(&self, source: &ImageRef, name: Option<&str>) -> Result<Vec<u8>> {
        let (path, image) = source.path_and_image();
        match source.transport {
            TransportKind::Docker => self.copy_from_registry(source, name).await,
            TransportKind::Oci => {
                let layout = OciLayout::open(path)?;
                let loaded = layout.load_image(image)?;
                self.import(&layout, &loaded, name).await
            }
            TransportKind::OciArchive => {
                let archive = OciArchive::open(Path::new(path))?;
                let loaded = archive.layout().load_image(image)?;
                self.import(archive.layout(), &loaded, name).await
            }
            TransportKind::DockerArchive => {
                let archive = DockerArchive::open(Path::new(path))?;
                let position = archive.select(image)?;
                let staging = self.store.staging_dir()?;
                let layout = OciLayout::create(staging.path())?;
                let loaded = archive.load_into(position, &layout)?;
                self.import(&layout, &loaded, name).await
            }
            TransportKind::Dir => {
                let staging = self.store.staging_dir()?;
                let layout = OciLayout::create(staging.path())?;
                let loaded = read_dir(Path::new(&source.within), &layout)?;
                self.import(&layout, &loaded, name).await
            }
            TransportKind::ContainersStorage => {
                let (layout, loaded) = self.load_stored(source).await?;
                self.import(&layout, &loaded, name).await
            }
            TransportKind::DockerDaemon => Err(unsupported(source, TransportKind::ContainersStorage)),
        }
    }

    async fn copy_from_store(&self, source: &ImageRef, destination: &ImageRef) -> Result<Vec<u8>> {
        let (layout, image) = self.load_stored(source).await?;
        let manifest_type = self.options.manifest_type;
        let (path, name) = destination.path_and_image();
        match destination.transport {
            TransportKind::Oci => {
                OciLayout::create(path)?.import(&layout, &image, ref_name_annotations(name), manifest_type)
            }
            TransportKind::Dir => write_dir(Path::new(&destination.within), &layout, &image, manifest_type),
            TransportKind::DockerArchive | TransportKind::OciArchive => {
                let staging = ArchiveStaging::open(Path::new(path))?.ok_or_else(|| {
                    ImageError::Transport(format!(
                        "{} is not an archive being written; use an archive writer",
                        destination
                    ))
                })?;
                let entry = name.ok_or_else(|| ImageError::ReferenceParse {
                    reference: destination.to_string(),
                    message: "missing archive entry".to_string(),
                })?;
                let tags: &[ImageReference] = match destination.transport {
                    TransportKind::DockerArchive => &self.options.docker_archive_additional_tags,
                    _ => &[],
                };
                staging.add(&layout, &image, entry, tags, manifest_type)
            }
            _ => Err(unsupported(source, destination.transport)),
        }
    }

    async fn load_stored(&self, source: &ImageRef) -> Result<(OciLayout, LayoutImage)> {
        let local = self
            .store
            .lookup(&source.within, &LookupOptions::default())
            .await?;
        self.store.load(&local.id)
    }
}

#[async_trait]
impl Copier for LocalCopier {
    async fn copy(&mut self, source: &ImageRef, destination: &ImageRef) -> Result<Vec<u8>> {
        tracing::debug!(source = %source, destination = %destination, "Copying image");
        let manifest = if destination.transport == TransportKind::ContainersStorage {
            let name = storage_name(destination)?;
            self.copy_to_store(source, name.as_deref()).await?
        } else if source.transport == TransportKind::ContainersStorage {
            self.copy_from_store(source, destination).await?
        } else {
            return Err(unsupported(source, destination.transport));
        };
        self.copies += 1;
        Ok(manifest)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        tracing::trace!(copies = self.copies, "Releasing copier");
        Ok(())
    }
}

/// Name a store destination is committed under; `None` for ID references.
fn storage_name(destination: &ImageRef) -> Result<Option<String>> {
    if is_image_id(&destination.within) {
        return Ok(None);
    }
    Ok(Some(ImageReference::parse(&destination.within)?.full_reference()))
}

fn unsupported(source: &ImageRef, destination: TransportKind) -> ImageError {
    ImageError::Transport(format!(
        "copying from {} to {} is not supported",
        source.transport, destination
    ))
}
