//! In-memory collaborators for engine tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use imgflow_core::error::{ImageError, Result};
use imgflow_core::event::EventEmitter;
use imgflow_core::platform::PlatformSpec;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ImageRuntime, SystemContext};
use crate::oci::archive::{ArchiveWriter, SaveFormat};
use crate::oci::layout::sha256_digest;
use crate::oci::reference::{is_image_id, ImageReference};
use crate::oci::shortnames::{CandidateResolver, PullCandidate, Resolved};
use crate::oci::store::{LocalImage, LocalStore, LookupOptions};
use crate::oci::transport::{
    Copier, CopyOptions, ImageRef, SourceInfo, Transport, TransportKind,
};

/// 64-hex image ID derived from `seed`.
pub(crate) fn image_id(seed: &str) -> String {
    sha256_digest(seed.as_bytes())
        .trim_start_matches("sha256:")
        .to_string()
}

/// Manifest bytes the fake copier returns for image `id`.
pub(crate) fn manifest_for(id: &str) -> Vec<u8> {
    format!("manifest-{}", id).into_bytes()
}

fn config_for(platform: &PlatformSpec) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "os": platform.os,
        "architecture": platform.architecture,
        "rootfs": { "type": "layers", "diff_ids": [] }
    }))
    .unwrap()
}

#[derive(Debug, Clone)]
struct FakeImage {
    id: String,
    names: Vec<String>,
    digests: Vec<String>,
    config: Vec<u8>,
    corrupted: bool,
}

/// Store keeping images in memory. Names are stored fully qualified.
#[derive(Default)]
pub(crate) struct FakeStore {
    images: Mutex<Vec<FakeImage>>,
    remote_digests: Mutex<HashMap<String, std::result::Result<String, String>>>,
    pub lookups: Mutex<Vec<String>>,
    pub digest_checks: Mutex<Vec<String>>,
}

impl FakeStore {
    /// Add an image for the host platform; returns its ID.
    pub fn add(&self, seed: &str, names: &[&str]) -> String {
        self.add_for(seed, names, &PlatformSpec::host())
    }

    pub fn add_for(&self, seed: &str, names: &[&str], platform: &PlatformSpec) -> String {
        let id = image_id(seed);
        self.put(&id, names.iter().map(|n| qualify(n)).collect(), config_for(platform));
        id
    }

    fn put(&self, id: &str, names: Vec<String>, config: Vec<u8>) {
        let digest = sha256_digest(&manifest_for(id));
        let mut images = self.images.lock();
        for other in images.iter_mut() {
            other.names.retain(|n| !names.contains(n));
        }
        match images.iter_mut().find(|image| image.id == id) {
            Some(image) => {
                for name in names {
                    if !image.names.contains(&name) {
                        image.names.push(name);
                    }
                }
                image.corrupted = false;
            }
            None => images.push(FakeImage {
                id: id.to_string(),
                names,
                digests: vec![digest],
                config,
                corrupted: false,
            }),
        }
    }

    pub fn corrupt(&self, id: &str) {
        if let Some(image) = self.images.lock().iter_mut().find(|i| i.id == id) {
            image.corrupted = true;
        }
    }

    /// Digest the registry reports for `candidate`.
    pub fn set_remote_digest(&self, candidate: &str, digest: String) {
        self.remote_digests
            .lock()
            .insert(qualify(candidate), Ok(digest));
    }

    pub fn fail_remote_digest(&self, candidate: &str, message: &str) {
        self.remote_digests
            .lock()
            .insert(qualify(candidate), Err(message.to_string()));
    }

    /// Manifest digest of stored image `id`.
    pub fn digest_of(&self, id: &str) -> String {
        sha256_digest(&manifest_for(id))
    }

    pub fn names_of(&self, id: &str) -> Vec<String> {
        self.images
            .lock()
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.names.clone())
            .unwrap_or_default()
    }
}

fn qualify(name: &str) -> String {
    ImageReference::parse(name).unwrap().full_reference()
}

#[async_trait]
impl LocalStore for FakeStore {
    async fn lookup(&self, name: &str, _options: &LookupOptions) -> Result<LocalImage> {
        self.lookups.lock().push(name.to_string());
        let images = self.images.lock();
        let hex = name.trim_start_matches("sha256:");
        if name.starts_with("sha256:") || is_image_id(name) {
            if let Some(image) = images.iter().find(|i| i.id.starts_with(hex)) {
                return Ok(LocalImage {
                    id: image.id.clone(),
                    resolved_name: hex.to_string(),
                    digests: image.digests.clone(),
                });
            }
            return Err(ImageError::ImageUnknown(name.to_string()));
        }

        let reference = ImageReference::parse(name)?;
        let found = images.iter().find(|image| match &reference.digest {
            Some(digest) => {
                image.digests.contains(digest)
                    && image.names.iter().any(|n| {
                        ImageReference::parse(n).map_or(false, |r| r.name() == reference.name())
                    })
            }
            None => image.names.contains(&reference.full_reference()),
        });
        match found {
            Some(image) => Ok(LocalImage {
                id: image.id.clone(),
                resolved_name: reference.full_reference(),
                digests: image.digests.clone(),
            }),
            None => Err(ImageError::ImageUnknown(name.to_string())),
        }
    }

    async fn verify(&self, image: &LocalImage) -> Result<()> {
        let images = self.images.lock();
        match images.iter().find(|i| i.id == image.id) {
            Some(stored) if stored.corrupted => Err(ImageError::Store(format!(
                "image {} is corrupted",
                image.id
            ))),
            Some(_) => Ok(()),
            None => Err(ImageError::ImageUnknown(image.id.clone())),
        }
    }

    async fn digest_differs(
        &self,
        image: &LocalImage,
        candidate: &ImageReference,
        _context: &SystemContext,
    ) -> Result<bool> {
        let candidate_name = candidate.full_reference();
        self.digest_checks.lock().push(candidate_name.clone());
        match self.remote_digests.lock().get(&candidate_name) {
            Some(Ok(digest)) => Ok(!image.digests.contains(digest)),
            Some(Err(message)) => Err(ImageError::Registry {
                registry: candidate.registry.clone(),
                message: message.clone(),
            }),
            None => Ok(true),
        }
    }

    async fn image_id_for_digest(&self, reference: &ImageReference) -> Result<String> {
        let digest = reference.digest.clone().unwrap_or_default();
        self.images
            .lock()
            .iter()
            .find(|i| i.digests.contains(&digest))
            .map(|i| i.id.clone())
            .ok_or_else(|| ImageError::ImageUnknown(reference.to_string()))
    }

    async fn config_blob(&self, id: &str) -> Result<Vec<u8>> {
        self.images
            .lock()
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.config.clone())
            .ok_or_else(|| ImageError::ImageUnknown(id.to_string()))
    }
}

/// A copy the fake copier performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CopyCall {
    pub source: String,
    pub destination: String,
    /// Docker-archive tags handed to the copier
    pub tags: Vec<String>,
}

/// Shared state behind [`FakeTransport`] and its copiers and writers.
#[derive(Default)]
pub(crate) struct TransportState {
    /// Source (candidate reference or transport string) → image seed or error
    outcomes: Mutex<HashMap<String, std::result::Result<String, String>>>,
    sources: Mutex<HashMap<String, SourceInfo>>,
    tags: Mutex<Vec<String>>,
    pub copies: Mutex<Vec<CopyCall>>,
    pub copiers_opened: Mutex<usize>,
    pub copiers_closed: Mutex<usize>,
    pub copier_close_error: Mutex<Option<String>>,
    pub archive_copy_error: Mutex<Option<String>>,
    pub writers_opened: Mutex<Vec<(SaveFormat, String)>>,
    pub writer_references: Mutex<Vec<Option<String>>>,
    pub writers_closed: Mutex<usize>,
    pub writer_close_error: Mutex<Option<String>>,
    /// Cancelled after the first successful store copy
    pub cancel_after_copy: Mutex<Option<CancellationToken>>,
}

/// Transport whose copies only touch a [`FakeStore`].
pub(crate) struct FakeTransport {
    store: Arc<FakeStore>,
    pub state: Arc<TransportState>,
}

impl FakeTransport {
    pub fn new(store: Arc<FakeStore>) -> Self {
        Self {
            store,
            state: Arc::new(TransportState::default()),
        }
    }

    /// Copying `source` succeeds and stores the image made from `seed`.
    pub fn serve(&self, source: &str, seed: &str) {
        self.state
            .outcomes
            .lock()
            .insert(source_key_str(source), Ok(seed.to_string()));
    }

    pub fn fail(&self, source: &str, message: &str) {
        self.state
            .outcomes
            .lock()
            .insert(source_key_str(source), Err(message.to_string()));
    }

    pub fn set_source(&self, source: &str, info: SourceInfo) {
        self.state.sources.lock().insert(source.to_string(), info);
    }

    pub fn set_tags(&self, tags: &[&str]) {
        *self.state.tags.lock() = tags.iter().map(|t| t.to_string()).collect();
    }

    /// Sources of every copy into the store, in order.
    pub fn pulled_sources(&self) -> Vec<String> {
        self.state
            .copies
            .lock()
            .iter()
            .filter(|c| c.destination.starts_with("containers-storage:"))
            .map(|c| c.source.clone())
            .collect()
    }

    pub fn copy_count(&self) -> usize {
        self.state.copies.lock().len()
    }
}

fn source_key_str(source: &str) -> String {
    match ImageRef::parse(source) {
        Ok(Some(r)) => source_key(&r),
        _ => qualify(source),
    }
}

/// Registry sources are keyed by their qualified reference.
fn source_key(source: &ImageRef) -> String {
    match source.transport {
        TransportKind::Docker => source
            .docker_reference()
            .map(|r| r.full_reference())
            .unwrap_or_else(|| source.to_string()),
        _ => source.to_string(),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn new_copier(&self, options: &CopyOptions) -> Result<Box<dyn Copier>> {
        *self.state.copiers_opened.lock() += 1;
        Ok(Box::new(FakeCopier {
            store: self.store.clone(),
            state: self.state.clone(),
            options: options.clone(),
        }))
    }

    async fn list_tags(&self, _repository: &ImageReference) -> Result<Vec<String>> {
        Ok(self.state.tags.lock().clone())
    }

    async fn inspect_source(&self, source: &ImageRef) -> Result<SourceInfo> {
        self.state
            .sources
            .lock()
            .get(&source.to_string())
            .cloned()
            .ok_or_else(|| ImageError::Transport(format!("{}: no such source", source)))
    }

    async fn new_archive_writer(
        &self,
        format: SaveFormat,
        path: &Path,
    ) -> Result<Box<dyn ArchiveWriter>> {
        self.state
            .writers_opened
            .lock()
            .push((format, path.display().to_string()));
        Ok(Box::new(FakeArchiveWriter {
            state: self.state.clone(),
            format,
            entries: 0,
        }))
    }
}

struct FakeCopier {
    store: Arc<FakeStore>,
    state: Arc<TransportState>,
    options: CopyOptions,
}

#[async_trait]
impl Copier for FakeCopier {
    async fn copy(&mut self, source: &ImageRef, destination: &ImageRef) -> Result<Vec<u8>> {
        self.state.copies.lock().push(CopyCall {
            source: source_key(source),
            destination: destination.to_string(),
            tags: self
                .options
                .docker_archive_additional_tags
                .iter()
                .map(|t| t.full_reference())
                .collect(),
        });

        if destination.transport != TransportKind::ContainersStorage {
            return match self.state.archive_copy_error.lock().clone() {
                Some(message) => Err(ImageError::Transport(message)),
                None => Ok(b"{}".to_vec()),
            };
        }

        let outcome = self.state.outcomes.lock().get(&source_key(source)).cloned();
        match outcome {
            Some(Ok(seed)) => {
                let id = image_id(&seed);
                let names = if is_image_id(&destination.within) {
                    Vec::new()
                } else {
                    vec![qualify(&destination.within)]
                };
                self.store.put(&id, names, config_for(&self.options.platform.clone().or(&PlatformSpec::host())));
                if let Some(token) = self.state.cancel_after_copy.lock().as_ref() {
                    token.cancel();
                }
                Ok(manifest_for(&id))
            }
            Some(Err(message)) => Err(ImageError::Transport(message)),
            None => Err(ImageError::Transport(format!(
                "initializing source {}: manifest unknown",
                source
            ))),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        *self.state.copiers_closed.lock() += 1;
        match self.state.copier_close_error.lock().clone() {
            Some(message) => Err(ImageError::Transport(message)),
            None => Ok(()),
        }
    }
}

struct FakeArchiveWriter {
    state: Arc<TransportState>,
    format: SaveFormat,
    entries: usize,
}

#[async_trait]
impl ArchiveWriter for FakeArchiveWriter {
    fn new_reference(&mut self, name: Option<&str>) -> Result<ImageRef> {
        self.state
            .writer_references
            .lock()
            .push(name.map(String::from));
        self.entries += 1;
        let transport = match self.format {
            SaveFormat::DockerArchive => TransportKind::DockerArchive,
            _ => TransportKind::OciArchive,
        };
        ImageRef::new(transport, format!("/fake/archive:entry-{}", self.entries))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        *self.state.writers_closed.lock() += 1;
        match self.state.writer_close_error.lock().clone() {
            Some(message) => Err(ImageError::Archive(message)),
            None => Ok(()),
        }
    }
}

/// Resolver returning a fixed candidate list.
#[derive(Default)]
pub(crate) struct FakeResolver {
    /// Candidates for every name; the name itself, qualified, when empty
    pub candidates: Vec<String>,
    pub description: String,
    pub error: Option<String>,
    pub record_error: bool,
    pub recorded: Arc<Mutex<Vec<String>>>,
    pub resolved: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn with_candidates(candidates: &[&str]) -> Self {
        Self {
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            description: "Resolving \"app\" using unqualified-search registries".to_string(),
            ..Default::default()
        }
    }
}

impl CandidateResolver for FakeResolver {
    fn resolve(&self, _context: &SystemContext, name: &str) -> Result<Resolved> {
        self.resolved.lock().push(name.to_string());
        if let Some(message) = &self.error {
            return Err(ImageError::InvalidInput(message.clone()));
        }
        let names = if self.candidates.is_empty() {
            vec![name.to_string()]
        } else {
            self.candidates.clone()
        };
        let mut candidates = Vec::new();
        for candidate in names {
            let value = ImageReference::parse(&candidate)?;
            let recorded = self.recorded.clone();
            let fail = self.record_error;
            candidates.push(PullCandidate::new(value).with_recorder(move || {
                recorded.lock().push(candidate);
                if fail {
                    return Err(ImageError::Config("read-only file system".to_string()));
                }
                Ok(())
            }));
        }
        Ok(Resolved {
            description: if self.candidates.is_empty() {
                String::new()
            } else {
                self.description.clone()
            },
            candidates,
        })
    }
}

/// `Write` sink whose contents tests can read back.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A runtime wired to fakes, plus handles on them.
pub(crate) struct Harness {
    pub store: Arc<FakeStore>,
    pub transport: Arc<FakeTransport>,
    pub resolver: Arc<FakeResolver>,
    pub events: EventEmitter,
    pub runtime: ImageRuntime,
}

pub(crate) fn harness(resolver: FakeResolver) -> Harness {
    harness_with(resolver, SystemContext::default())
}

pub(crate) fn harness_with(resolver: FakeResolver, context: SystemContext) -> Harness {
    let store = Arc::new(FakeStore::default());
    let transport = Arc::new(FakeTransport::new(store.clone()));
    let resolver = Arc::new(resolver);
    let events = EventEmitter::new(64);
    let runtime = ImageRuntime::new(store.clone(), resolver.clone(), transport.clone(), context)
        .with_events(events.clone());
    Harness {
        store,
        transport,
        resolver,
        events,
        runtime,
    }
}
