//! Pull policy and the candidate waterfall.

use std::io::Write;
use std::time::Duration;

use imgflow_core::error::{chain_cleanup, ImageError, PullErrors, Result};
use imgflow_core::event::ImageEvent;
use imgflow_core::platform::PlatformSpec;
use imgflow_core::policy::PullPolicy;
use tokio_util::sync::CancellationToken;

use super::platform::check_platform;
use super::{ImageRuntime, SystemContext};
use crate::oci::layout::sha256_digest;
use crate::oci::reference::{is_image_id, normalize_tagged_digested, ImageReference};
use crate::oci::shortnames::Resolved;
use crate::oci::store::{LocalImage, LookupOptions};
use crate::oci::transport::{Copier, CopyOptions, ImageRef, TransportKind};

/// Options of [`ImageRuntime::pull`].
#[derive(Default)]
pub struct PullOptions {
    /// Requested platform; empty fields fall back to the runtime's choice
    pub platform: PlatformSpec,
    /// Pull every tag of the repository (registry transport only)
    pub all_tags: bool,
    /// Retries after a failed copy; runtime default when unset
    pub max_retries: Option<u32>,
    /// Delay between retries; runtime default when unset
    pub retry_delay: Option<Duration>,
    /// Progress and warnings for the user
    pub writer: Option<Box<dyn Write + Send>>,
    /// Checked between tags of an all-tags pull
    pub cancel: CancellationToken,
}

impl PullOptions {
    fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            platform: self.platform.clone(),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            ..Default::default()
        }
    }
}

impl ImageRuntime {
    /// Pull `name` according to `policy`.
    ///
    /// `name` is either transport-qualified (`oci-archive:/tmp/a.tar`) or a
    /// possibly-unqualified registry name. With [`PullPolicy::Never`] and no
    /// local match the error is [`ImageError::ImageUnknown`].
    pub async fn pull(
        &self,
        name: &str,
        policy: PullPolicy,
        mut options: PullOptions,
    ) -> Result<Vec<LocalImage>> {
        tracing::debug!(name, policy = %policy, "Pulling image");
        let result = self.pull_inner(name, policy, &mut options).await;
        if let Err(e) = &result {
            // The input name keeps the transport
            self.emit(ImageEvent::pull_error(name, e));
        }
        result
    }

    async fn pull_inner(
        &self,
        name: &str,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<Vec<LocalImage>> {
        if options.max_retries.is_none() {
            options.max_retries = Some(self.retry.max_retries);
        }
        if options.retry_delay.is_none() {
            options.retry_delay = self.retry.retry_delay;
        }

        let (source, unqualified) = match ImageRef::parse(name) {
            Ok(Some(source)) if source.transport == TransportKind::Docker => {
                // docker:// names are taken as fully qualified
                let reference = source.docker_reference().ok_or_else(|| {
                    ImageError::Internal("unexpected nil reference".to_string())
                })?;
                (source, Some(reference.full_reference()))
            }
            Ok(Some(source)) => (source, None),
            Ok(None) => return self.pull_registry_name(name, policy, options).await,
            Err(e) => match TransportKind::prefix_of(name) {
                Some(kind) if kind != TransportKind::Docker => return Err(e),
                _ => return self.pull_registry_name(name, policy, options).await,
            },
        };
        self.pull_reference(name, &source, unqualified.as_deref(), policy, options)
            .await
    }

    /// Pull a name that carries no transport.
    async fn pull_registry_name(
        &self,
        name: &str,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<Vec<LocalImage>> {
        if is_image_id(name) {
            if policy == PullPolicy::Always {
                return Err(ImageError::PolicyViolation(format!(
                    "pull policy is always but image has been referred to by ID ({})",
                    name
                )));
            }
            let local = self.store.lookup(name, &LookupOptions::default()).await?;
            return Ok(vec![local]);
        }

        let normalized = normalize_tagged_digested(name).map_err(|e| ImageError::ReferenceParse {
            reference: name.to_string(),
            message: e.to_string(),
        })?;
        let reference = ImageReference::parse(&normalized)?;
        let source = ImageRef::docker(&reference);
        self.pull_reference(name, &source, Some(&normalized), policy, options)
            .await
    }

    async fn pull_reference(
        &self,
        name: &str,
        source: &ImageRef,
        unqualified: Option<&str>,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<Vec<LocalImage>> {
        if options.all_tags && source.transport != TransportKind::Docker {
            return Err(ImageError::InvalidInput(format!(
                "pulling all tags is not supported for {} transport",
                source.transport
            )));
        }

        options.platform = std::mem::take(&mut options.platform).or(&self.system_context.platform);

        let pulled = self
            .pull_from_transport(source, unqualified, policy, options)
            .await?;

        let mut images = Vec::with_capacity(pulled.len());
        for pulled_name in pulled {
            let image = self
                .store
                .lookup(&pulled_name, &LookupOptions::default())
                .await
                .map_err(|e| {
                    ImageError::Store(format!(
                        "locating pulled image {:?} in local storage: {}",
                        pulled_name, e
                    ))
                })?;

            let config = self.store.config_blob(&image.id).await?;
            if let Some(mismatch) = check_platform(&config, &options.platform)? {
                match options.writer.as_mut() {
                    Some(writer) => writeln!(writer, "WARNING: {}", mismatch)?,
                    None => tracing::warn!(image = %image.id, "{}", mismatch),
                }
            }

            self.emit(ImageEvent::pull(image.id.clone(), name));
            images.push(image);
        }
        Ok(images)
    }

    /// Hand the reference to the pull handler of its transport.
    async fn pull_from_transport(
        &self,
        source: &ImageRef,
        unqualified: Option<&str>,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<Vec<String>> {
        match source.transport {
            TransportKind::Docker => {
                let name = unqualified
                    .unwrap_or_else(|| source.within.trim_start_matches('/'))
                    .to_string();
                self.copy_from_registry(source, &name, policy, options).await
            }
            TransportKind::DockerArchive => {
                self.copy_from_docker_archive(source, &options.copy_options())
                    .await
            }
            TransportKind::Oci
            | TransportKind::OciArchive
            | TransportKind::Dir
            | TransportKind::DockerDaemon
            | TransportKind::ContainersStorage => {
                self.copy_from_default(source, &options.copy_options()).await
            }
        }
    }

    /// Import a non-registry source, naming it by the rule of its transport.
    async fn copy_from_default(
        &self,
        source: &ImageRef,
        copy_options: &CopyOptions,
    ) -> Result<Vec<String>> {
        let (dest_name, image_name) = match source.transport {
            TransportKind::Oci => match source.path_and_image().1 {
                Some(name) => (name.to_string(), name.to_string()),
                None => self.id_names(source).await?,
            },
            TransportKind::OciArchive => {
                let info = self.transport.inspect_source(source).await?;
                match info.names.first() {
                    Some(name) => {
                        let normalized = normalize_name(name)?;
                        (normalized.clone(), normalized)
                    }
                    None => {
                        let id = info.image_id();
                        (id.clone(), format!("sha256:{}", id))
                    }
                }
            }
            TransportKind::DockerDaemon => {
                let reference = source.docker_reference().ok_or_else(|| {
                    ImageError::ReferenceParse {
                        reference: source.to_string(),
                        message: "docker-daemon references must name an image".to_string(),
                    }
                })?;
                let name = reference.full_reference();
                (name.clone(), name)
            }
            TransportKind::ContainersStorage => {
                let image_name = source
                    .docker_reference()
                    .map(|r| r.full_reference())
                    .unwrap_or_else(|| source.within.clone());
                (source.within.clone(), image_name)
            }
            TransportKind::Dir => self.id_names(source).await?,
            TransportKind::Docker | TransportKind::DockerArchive => {
                return Err(ImageError::Internal(format!(
                    "{} sources have their own pull handler",
                    source.transport
                )))
            }
        };

        tracing::debug!(source = %source, destination = %dest_name, "Importing image");
        let mut copier = self.transport.new_copier(copy_options)?;
        let outcome = copier
            .copy(source, &ImageRef::storage(dest_name))
            .await
            .map(drop);
        chain_cleanup(outcome, copier.close().await)?;
        Ok(vec![image_name])
    }

    /// Store under the image ID; looked up again as `sha256:<id>`.
    async fn id_names(&self, source: &ImageRef) -> Result<(String, String)> {
        let id = self.transport.inspect_source(source).await?.image_id();
        Ok((id.clone(), format!("sha256:{}", id)))
    }

    /// Import every name a docker-archive entry carries.
    async fn copy_from_docker_archive(
        &self,
        source: &ImageRef,
        copy_options: &CopyOptions,
    ) -> Result<Vec<String>> {
        let info = self.transport.inspect_source(source).await?;
        let (dest_names, image_names) = if info.names.is_empty() {
            let id = info.image_id();
            (vec![id.clone()], vec![format!("sha256:{}", id)])
        } else {
            let names = info
                .names
                .iter()
                .map(|name| normalize_name(name))
                .collect::<Result<Vec<_>>>()?;
            (names.clone(), names)
        };

        let mut copier = self.transport.new_copier(copy_options)?;
        let mut outcome = Ok(());
        for dest_name in dest_names {
            if let Err(e) = copier.copy(source, &ImageRef::storage(dest_name)).await {
                outcome = Err(e);
                break;
            }
        }
        chain_cleanup(outcome, copier.close().await)?;
        Ok(image_names)
    }

    /// Pull one name, or every tag of its repository.
    async fn copy_from_registry(
        &self,
        source: &ImageRef,
        name: &str,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<Vec<String>> {
        if !options.all_tags {
            let pulled = self
                .copy_single_image_from_registry(name, policy, options)
                .await?;
            return Ok(vec![pulled]);
        }

        let repository = source.docker_reference().ok_or_else(|| {
            ImageError::Internal("unexpected nil reference".to_string())
        })?;
        let tags = self.transport.list_tags(&repository).await?;
        tracing::debug!(repository = %repository.name(), tags = tags.len(), "Pulling all tags");

        let mut pulled = Vec::with_capacity(tags.len());
        for tag in tags {
            if options.cancel.is_cancelled() {
                tracing::info!(
                    repository = %repository.name(),
                    pulled = pulled.len(),
                    "Pulling all tags cancelled"
                );
                break;
            }
            let tagged = repository.with_tag(&tag)?;
            pulled.push(
                self.copy_single_image_from_registry(&tagged.full_reference(), policy, options)
                    .await?,
            );
        }
        Ok(pulled)
    }

    /// The waterfall for one possibly-unqualified name. Returns a name or ID
    /// the pulled image can be looked up by.
    async fn copy_single_image_from_registry(
        &self,
        image_name: &str,
        policy: PullPolicy,
        options: &mut PullOptions,
    ) -> Result<String> {
        let mut image_name = image_name.to_string();
        let mut policy = policy;

        let lookup_options = LookupOptions {
            platform: lookup_platform(&options.platform),
        };
        let mut local = match self.store.lookup(&image_name, &lookup_options).await {
            Ok(local) => Some(local),
            Err(e) if e.is_image_unknown() => None,
            Err(e) => {
                tracing::error!(name = %image_name, error = %e, "Looking up image in local storage");
                None
            }
        };

        if let Some(image) = local.take() {
            match self.store.verify(&image).await {
                Ok(()) => local = Some(image),
                Err(e) => tracing::error!(id = %image.id, error = %e, "Local image is corrupted, pulling again"),
            }
        }

        let custom_platform = !options.platform.is_empty();
        if custom_platform && policy != PullPolicy::Always && policy != PullPolicy::Never {
            policy = PullPolicy::Newer;
            tracing::debug!(
                policy = %policy,
                platform = %options.platform,
                "Enforcing pull policy for custom platform"
            );
        }

        if policy == PullPolicy::Never {
            return match local {
                Some(local) => {
                    tracing::debug!(name = %image_name, resolved = %local.resolved_name, "Pull policy never, using local image");
                    Ok(local.resolved_name)
                }
                None => Err(ImageError::ImageUnknown(image_name)),
            };
        }

        if let Some(local) = &local {
            if policy == PullPolicy::Missing {
                return Ok(local.resolved_name.clone());
            }
            // An ID cannot be pulled from anywhere
            if local.found_by_id() {
                return match policy {
                    PullPolicy::Always => Err(ImageError::PolicyViolation(format!(
                        "pull policy is always but image has been referred to by ID ({})",
                        image_name
                    ))),
                    _ => Ok(local.resolved_name.clone()),
                };
            }
            if !custom_platform {
                if image_name != local.resolved_name {
                    tracing::debug!(
                        name = %image_name,
                        resolved = %local.resolved_name,
                        "Using name of local image for pulling"
                    );
                }
                image_name = local.resolved_name.clone();
            }
        }

        let context = SystemContext {
            platform: options.platform.clone(),
        };
        let resolved = match self.resolver.resolve(&context, &image_name) {
            Ok(resolved) => resolved,
            Err(e) => {
                return match local {
                    Some(local) if policy == PullPolicy::Newer => Ok(local.resolved_name),
                    _ => Err(e),
                }
            }
        };

        let mut copier = self.transport.new_copier(&options.copy_options())?;
        let outcome = self
            .walk_candidates(
                copier.as_mut(),
                resolved,
                &image_name,
                local.as_ref(),
                policy,
                &context,
                options,
            )
            .await;
        let outcome = chain_cleanup(outcome, copier.close().await)?;

        match (outcome, local) {
            (Some(pulled), _) => Ok(pulled),
            (None, Some(local)) => Ok(local.resolved_name),
            (None, None) => Err(ImageError::Internal(format!(
                "no image pulled for {} and no local image to fall back to",
                image_name
            ))),
        }
    }

    /// Try each candidate in order until one is copied.
    ///
    /// `Ok(None)` means nothing newer was available for the local image.
    #[allow(clippy::too_many_arguments)]
    async fn walk_candidates(
        &self,
        copier: &mut dyn Copier,
        resolved: Resolved,
        image_name: &str,
        local: Option<&LocalImage>,
        policy: PullPolicy,
        context: &SystemContext,
        options: &mut PullOptions,
    ) -> Result<Option<String>> {
        let Resolved {
            description,
            candidates,
        } = resolved;
        let mut wrote_description = false;
        let mut errors = PullErrors::new();

        for mut candidate in candidates {
            let candidate_name = candidate.value.full_reference();
            tracing::debug!(candidate = %candidate_name, name = image_name, "Attempting to pull candidate");

            if let (PullPolicy::Newer, Some(local)) = (policy, local) {
                match self.store.digest_differs(local, &candidate.value, context).await {
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                    Ok(false) => {
                        tracing::debug!(
                            candidate = %candidate_name,
                            "Skipping pull candidate, the image is not newer"
                        );
                        continue;
                    }
                    Ok(true) => {}
                }
            }

            if !wrote_description {
                wrote_description = true;
                if !description.is_empty() {
                    tracing::debug!("{}", description);
                    if let Some(writer) = options.writer.as_mut() {
                        writeln!(writer, "{}", description)?;
                    }
                }
            }
            if let Some(writer) = options.writer.as_mut() {
                writeln!(writer, "Trying to pull {}...", candidate_name)?;
            }

            let source = ImageRef::docker(&candidate.value);
            let destination = ImageRef::storage(candidate_name.clone());
            let manifest = match copier.copy(&source, &destination).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::debug!(candidate = %candidate_name, error = %e, "Error pulling candidate");
                    errors.push(e);
                    continue;
                }
            };

            if let Err(e) = candidate.record() {
                // Read-only systems cannot record aliases
                tracing::error!(candidate = %candidate_name, error = %e, "Error recording short-name alias");
            }
            tracing::debug!(candidate = %candidate_name, "Pulled candidate successfully");
            return self
                .image_id_for_pulled_image(&candidate.value, &manifest)
                .await
                .map(Some);
        }

        if local.is_some() && policy == PullPolicy::Newer {
            return Ok(None);
        }
        if errors.is_empty() {
            return Err(ImageError::NoCandidates {
                policy: policy.to_string(),
            });
        }
        Err(ImageError::CandidatesExhausted(errors))
    }

    /// ID of the image just stored for `value`, by manifest digest.
    async fn image_id_for_pulled_image(
        &self,
        value: &ImageReference,
        manifest: &[u8],
    ) -> Result<String> {
        let digested = value.with_digest(&sha256_digest(manifest))?;
        self.store
            .image_id_for_digest(&digested)
            .await
            .map_err(|e| ImageError::Store(format!("looking up a just-pulled image: {}", e)))
    }
}

/// Platform filter for the local lookup: OS and architecture only where
/// they differ from the host, since images often declare them wrongly.
fn lookup_platform(requested: &PlatformSpec) -> PlatformSpec {
    let host = PlatformSpec::host();
    PlatformSpec {
        architecture: if requested.architecture != host.architecture {
            requested.architecture.clone()
        } else {
            String::new()
        },
        os: if requested.os != host.os {
            requested.os.clone()
        } else {
            String::new()
        },
        variant: requested.variant.clone(),
    }
}

/// Fully-qualified form of a name found in an archive.
fn normalize_name(name: &str) -> Result<String> {
    Ok(ImageReference::parse(name)?.full_reference())
}
