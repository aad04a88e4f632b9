//! Registry access built on `oci-distribution`.
//!
//! Pulls a single-platform image into an OCI layout, resolves manifest
//! digests for digest comparison, and lists repository tags.

use imgflow_core::error::{ImageError, Result};
use imgflow_core::platform::PlatformSpec;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::credentials::CredentialStore;
use super::layout::OciLayout;
use super::reference::{ImageReference, DEFAULT_TAG};

/// Credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, anonymous when either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Stored credentials for `registry`, then the environment.
    pub fn for_registry(credentials: &CredentialStore, registry: &str) -> Self {
        match credentials.get(registry) {
            Ok(Some((username, password))) => Self::basic(username, password),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::from_env()
            }
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Outcome of pulling a manifest and its blobs.
#[derive(Debug, Clone)]
pub struct PulledImage {
    /// Manifest bytes as written to the layout
    pub manifest_bytes: Vec<u8>,
    /// Digest the registry reported for the platform manifest
    pub registry_digest: String,
}

/// Registry client.
pub struct RegistryClient {
    credentials: CredentialStore,
    auth: Option<RegistryAuth>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new(CredentialStore::default_path())
    }
}

impl RegistryClient {
    /// Client resolving credentials per registry from `credentials`.
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            credentials,
            auth: None,
        }
    }

    /// Client using `auth` for every registry.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self {
            credentials: CredentialStore::default_path(),
            auth: Some(auth),
        }
    }

    fn auth_for(&self, registry: &str) -> OciRegistryAuth {
        match &self.auth {
            Some(auth) => auth.to_oci_auth(),
            None => RegistryAuth::for_registry(&self.credentials, registry).to_oci_auth(),
        }
    }

    /// Pull `reference` for `platform` into `layout`.
    pub async fn pull_to_layout(
        &self,
        reference: &ImageReference,
        platform: &PlatformSpec,
        layout: &OciLayout,
    ) -> Result<PulledImage> {
        let oci_ref = to_oci_reference(reference)?;
        let client = client_for(platform);
        let auth = self.auth_for(&reference.registry);
        let registry_error = |message: String| ImageError::Registry {
            registry: reference.registry.clone(),
            message,
        };

        tracing::debug!(reference = %reference, platform = %platform, "Pulling image from registry");

        let (manifest, registry_digest) = client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_error(format!("failed to pull manifest: {}", e)))?;

        let mut blobs = vec![manifest.config.clone()];
        blobs.extend(manifest.layers.iter().cloned());
        for descriptor in &blobs {
            tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");
            let mut data: Vec<u8> = Vec::new();
            client
                .pull_blob(&oci_ref, descriptor, &mut data)
                .await
                .map_err(|e| registry_error(format!("failed to pull blob {}: {}", descriptor.digest, e)))?;
            let written = layout.write_blob(&data)?;
            if written != descriptor.digest {
                return Err(registry_error(format!(
                    "blob digest mismatch: expected {}, got {}",
                    descriptor.digest, written
                )));
            }
        }

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        layout.add_manifest(&manifest_bytes, Default::default())?;

        tracing::info!(reference = %reference, digest = %registry_digest, "Image pulled");
        Ok(PulledImage {
            manifest_bytes,
            registry_digest,
        })
    }

    /// Digest of the manifest `reference` resolves to on `platform`.
    pub async fn manifest_digest(
        &self,
        reference: &ImageReference,
        platform: &PlatformSpec,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let (_manifest, digest) = client_for(platform)
            .pull_image_manifest(&oci_ref, &self.auth_for(&reference.registry))
            .await
            .map_err(|e| ImageError::Registry {
                registry: reference.registry.clone(),
                message: format!("failed to fetch manifest: {}", e),
            })?;
        Ok(digest)
    }

    /// Every tag of the repository `reference` names.
    pub async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let oci_ref = to_oci_reference(&reference.with_tag(DEFAULT_TAG)?)?;
        let response = client_for(&PlatformSpec::default())
            .list_tags(&oci_ref, &self.auth_for(&reference.registry), None, None)
            .await
            .map_err(|e| ImageError::Registry {
                registry: reference.registry.clone(),
                message: format!("failed to list tags of {}: {}", reference.name(), e),
            })?;
        Ok(response.tags)
    }
}

fn client_for(platform: &PlatformSpec) -> Client {
    let wanted = platform.clone().or(&PlatformSpec::host()).normalized();
    let config = ClientConfig {
        protocol: ClientProtocol::Https,
        platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
            select_platform(entries, &wanted)
        })),
        ..Default::default()
    };
    Client::new(config)
}

/// Digest of the index entry matching `wanted`.
fn select_platform(entries: &[ImageIndexEntry], wanted: &PlatformSpec) -> Option<String> {
    entries
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |p| {
                let candidate = PlatformSpec::new(
                    p.os.as_str(),
                    p.architecture.as_str(),
                    p.variant.clone().unwrap_or_default(),
                )
                .normalized();
                candidate.os == wanted.os
                    && candidate.architecture == wanted.architecture
                    && (wanted.variant.is_empty() || candidate.variant == wanted.variant)
            })
        })
        .map(|entry| entry.digest.clone())
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| ImageError::ReferenceParse {
        reference: ref_str.clone(),
        message: e.to_string(),
    })
}
