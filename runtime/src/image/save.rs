//! Saving local images to directories and archives.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use imgflow_core::error::{chain_cleanup, ImageError, Result};
use imgflow_core::event::ImageEvent;

use super::ImageRuntime;
use crate::oci::archive::{ArchiveWriter, SaveFormat};
use crate::oci::reference::ImageReference;
use crate::oci::store::{LocalImage, LookupOptions};
use crate::oci::transport::{CopyOptions, ImageRef, TransportKind};

/// Options of [`ImageRuntime::save`].
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Extra tags for the saved image; only allowed with a single name
    pub additional_tags: Vec<String>,
    pub copy: CopyOptions,
}

/// One distinct image of a save, with every tag and name it is saved under.
#[derive(Debug)]
struct LocalImageEntry {
    image: LocalImage,
    /// Never deduplicated
    tags: Vec<ImageReference>,
    dest_names: Vec<String>,
}

impl ImageRuntime {
    /// Save the images `names` refer to as `format` at `path`.
    pub async fn save(
        &self,
        names: &[String],
        format: SaveFormat,
        path: &Path,
        options: SaveOptions,
    ) -> Result<()> {
        tracing::debug!(names = ?names, format = %format, path = %path.display(), "Saving images");
        let mut options = options;

        match names.len() {
            0 => {
                return Err(ImageError::InvalidInput(
                    "no image specified for saving images".to_string(),
                ))
            }
            1 => {}
            _ => {
                if !format.supports_multiple_images() {
                    return Err(ImageError::InvalidInput(format!(
                        "unsupported format {:?} for saving multiple images (only docker-archive and oci-archive)",
                        format.name()
                    )));
                }
                if !options.additional_tags.is_empty() {
                    return Err(ImageError::InvalidInput(
                        "cannot save multiple images with multiple tags".to_string(),
                    ));
                }
            }
        }

        options.copy.manifest_type = Some(format.manifest_type());
        match format {
            SaveFormat::OciDir | SaveFormat::DockerDir => {
                self.save_single_image(&names[0], format, path, &options)
                    .await
            }
            SaveFormat::DockerArchive | SaveFormat::OciArchive => {
                self.save_archive(names, format, path, &options).await
            }
        }
    }

    async fn save_single_image(
        &self,
        name: &str,
        format: SaveFormat,
        path: &Path,
        options: &SaveOptions,
    ) -> Result<()> {
        let image = self.store.lookup(name, &LookupOptions::default()).await?;
        let tag = (!image.found_by_id()).then(|| image.resolved_name.clone());

        let destination = match format {
            SaveFormat::OciDir => ImageRef::path(TransportKind::Oci, path, tag.as_deref())?,
            SaveFormat::DockerDir => ImageRef::path(TransportKind::Dir, path, None)?,
            _ => {
                return Err(ImageError::Internal(format!(
                    "{} is not a single-image format",
                    format
                )))
            }
        };

        let mut copier = self.transport.new_copier(&options.copy)?;
        let outcome = copier
            .copy(&ImageRef::storage(image.id.clone()), &destination)
            .await
            .map(drop);
        chain_cleanup(outcome, copier.close().await)?;

        self.emit(ImageEvent::save(image.id, path.display().to_string()));
        Ok(())
    }

    async fn save_archive(
        &self,
        names: &[String],
        format: SaveFormat,
        path: &Path,
        options: &SaveOptions,
    ) -> Result<()> {
        let mut additional_tags = Vec::with_capacity(options.additional_tags.len());
        for tag in &options.additional_tags {
            match ImageReference::parse(tag) {
                Ok(reference) if reference.tag.is_none() => {
                    return Err(ImageError::InvalidInput(format!(
                        "invalid additional tag {:?}: normalized to untagged {:?}",
                        tag,
                        reference.full_reference()
                    )))
                }
                Ok(reference) => additional_tags.push(reference),
                Err(e) => tracing::debug!(tag = %tag, error = %e, "Skipping unparsable additional tag"),
            }
        }

        // First-seen order of image IDs is the archive's image order
        let mut ordered_ids: Vec<String> = Vec::new();
        let mut entries: HashMap<String, LocalImageEntry> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();

        for name in names {
            let image = self.store.lookup(name, &LookupOptions::default()).await?;
            if !visited.insert(image.resolved_name.clone()) {
                tracing::debug!(name = %name, resolved = %image.resolved_name, "Skipping name resolved before");
                continue;
            }

            let tagged = if image.found_by_id() {
                None
            } else {
                ImageReference::parse(&image.resolved_name)
                    .ok()
                    .filter(|reference| reference.tag.is_some())
            };

            let entry = entries.entry(image.id.clone()).or_insert_with(|| {
                ordered_ids.push(image.id.clone());
                LocalImageEntry {
                    image: image.clone(),
                    tags: additional_tags.clone(),
                    dest_names: Vec::new(),
                }
            });
            if let Some(tagged) = tagged {
                entry.dest_names.push(tagged.full_reference());
                entry.tags.push(tagged);
            }
        }

        let mut writer = self.transport.new_archive_writer(format, path).await?;
        let outcome = match format {
            SaveFormat::DockerArchive => {
                self.save_docker_archive(writer.as_mut(), &ordered_ids, &entries, options)
                    .await
            }
            SaveFormat::OciArchive => {
                self.save_oci_archive(writer.as_mut(), &ordered_ids, &entries, options)
                    .await
            }
            _ => Err(ImageError::Internal(format!(
                "cannot save multiple images to format {}",
                format
            ))),
        };
        chain_cleanup(outcome, writer.close().await)?;

        for id in &ordered_ids {
            self.emit(ImageEvent::save(id.clone(), path.display().to_string()));
        }
        tracing::info!(path = %path.display(), images = ordered_ids.len(), format = %format, "Images saved");
        Ok(())
    }

    /// One archive entry per image, carrying all of its tags.
    async fn save_docker_archive(
        &self,
        writer: &mut dyn ArchiveWriter,
        ordered_ids: &[String],
        entries: &HashMap<String, LocalImageEntry>,
        options: &SaveOptions,
    ) -> Result<()> {
        for id in ordered_ids {
            let entry = lookup_entry(entries, id)?;
            let mut copy_options = options.copy.clone();
            copy_options.docker_archive_additional_tags = entry.tags.clone();

            let mut copier = self.transport.new_copier(&copy_options)?;
            let outcome = match writer.new_reference(None) {
                Ok(destination) => copier
                    .copy(&ImageRef::storage(entry.image.id.clone()), &destination)
                    .await
                    .map(drop),
                Err(e) => Err(e),
            };
            chain_cleanup(outcome, copier.close().await)?;
        }
        Ok(())
    }

    /// One archive entry per name an image was requested under.
    async fn save_oci_archive(
        &self,
        writer: &mut dyn ArchiveWriter,
        ordered_ids: &[String],
        entries: &HashMap<String, LocalImageEntry>,
        options: &SaveOptions,
    ) -> Result<()> {
        for id in ordered_ids {
            let entry = lookup_entry(entries, id)?;
            let source = ImageRef::storage(entry.image.id.clone());

            let mut copier = self.transport.new_copier(&options.copy)?;
            let mut outcome = Ok(());
            for dest_name in &entry.dest_names {
                let copied = match writer.new_reference(Some(dest_name.as_str())) {
                    Ok(destination) => copier.copy(&source, &destination).await.map(drop),
                    Err(e) => Err(e),
                };
                if copied.is_err() {
                    outcome = copied;
                    break;
                }
            }
            chain_cleanup(outcome, copier.close().await)?;
        }
        Ok(())
    }
}

fn lookup_entry<'a>(
    entries: &'a HashMap<String, LocalImageEntry>,
    id: &str,
) -> Result<&'a LocalImageEntry> {
    entries.get(id).ok_or_else(|| {
        ImageError::Internal(format!("image {} missing from the saved image set", id))
    })
}
