//! Short-name resolution.
//!
//! A name without a registry (`fedora`, `org/tool:1.0`) is expanded into an
//! ordered list of fully-qualified pull candidates. Aliases win over the
//! search registries; an alias learned from a successful pull is recorded in
//! the alias cache so the next resolution is unambiguous.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use imgflow_core::config::RegistriesConfig;
use imgflow_core::error::{ImageError, Result};
use parking_lot::Mutex;

use super::reference::{ImageReference, DEFAULT_TAG};
use crate::image::SystemContext;

/// Expands a possibly-unqualified name into pull candidates.
pub trait CandidateResolver: Send + Sync {
    fn resolve(&self, context: &SystemContext, name: &str) -> Result<Resolved>;
}

/// Outcome of a resolution.
#[derive(Debug, Default)]
pub struct Resolved {
    /// Human-readable account of how the name was resolved; empty for
    /// fully-qualified names
    pub description: String,
    /// Candidates in the order they must be tried
    pub candidates: Vec<PullCandidate>,
}

type Recorder = Box<dyn FnOnce() -> Result<()> + Send>;

/// A fully-qualified reference to try, plus how to remember it.
pub struct PullCandidate {
    pub value: ImageReference,
    recorder: Option<Recorder>,
}

impl PullCandidate {
    pub fn new(value: ImageReference) -> Self {
        Self {
            value,
            recorder: None,
        }
    }

    /// Attach the action run once this candidate was pulled.
    pub fn with_recorder(mut self, recorder: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.recorder = Some(Box::new(recorder));
        self
    }

    /// Record this candidate as the resolution of its short name. A no-op
    /// after the first call or without a recorder.
    pub fn record(&mut self) -> Result<()> {
        match self.recorder.take() {
            Some(recorder) => recorder(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PullCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullCandidate")
            .field("value", &self.value.full_reference())
            .field("recordable", &self.recorder.is_some())
            .finish()
    }
}

/// Alias file shared by every resolution of one resolver.
#[derive(Debug)]
struct AliasCache {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct AliasFile {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl AliasCache {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        let Some(path) = &self.path else {
            return Ok(BTreeMap::new());
        };
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = std::fs::read_to_string(path)?;
        let file: AliasFile = serde_yaml::from_str(&data).map_err(|e| {
            ImageError::Config(format!("failed to parse alias cache {}: {}", path.display(), e))
        })?;
        Ok(file.aliases)
    }

    fn get(&self, short_name: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(short_name))
    }

    fn record(&self, short_name: &str, value: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.lock.lock();
        let mut aliases = self.load()?;
        aliases.insert(short_name.to_string(), value.to_string());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_yaml::to_string(&AliasFile { aliases })?)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(short_name, value, path = %path.display(), "Recorded short-name alias");
        Ok(())
    }
}

/// Resolver driven by [`RegistriesConfig`].
pub struct SearchRegistriesResolver {
    config: RegistriesConfig,
    cache: Arc<AliasCache>,
}

impl SearchRegistriesResolver {
    pub fn new(config: RegistriesConfig) -> Self {
        let cache = Arc::new(AliasCache {
            path: config.alias_cache.clone(),
            lock: Mutex::new(()),
        });
        Self { config, cache }
    }
}

impl CandidateResolver for SearchRegistriesResolver {
    fn resolve(&self, _context: &SystemContext, name: &str) -> Result<Resolved> {
        let parts = ImageReference::split(name)?;
        if parts.domain.is_some() {
            return Ok(Resolved {
                description: String::new(),
                candidates: vec![PullCandidate::new(ImageReference::parse(name)?)],
            });
        }

        let short_name = parts.path.as_str();
        let qualify = |repository: &str| -> Result<ImageReference> {
            let base = ImageReference::parse(repository)?;
            match (&parts.digest, &parts.tag) {
                (Some(digest), _) => base.with_digest(digest),
                (None, Some(tag)) => base.with_tag(tag),
                (None, None) => base.with_tag(DEFAULT_TAG),
            }
        };

        let alias = match self.config.aliases.get(short_name) {
            Some(alias) => Some((alias.clone(), "configuration")),
            None => self.cache.get(short_name)?.map(|alias| (alias, "alias cache")),
        };
        if let Some((alias, origin)) = alias {
            let value = qualify(&alias)?;
            tracing::debug!(name, alias = %value, origin, "Resolved short name by alias");
            return Ok(Resolved {
                description: format!("Resolved {:?} as an alias ({})", short_name, origin),
                candidates: vec![PullCandidate::new(value)],
            });
        }

        let registries = &self.config.unqualified_search_registries;
        if registries.is_empty() {
            return Err(ImageError::InvalidInput(format!(
                "short-name {:?} did not resolve to an alias and no unqualified-search registries are defined",
                name
            )));
        }

        let mut candidates = Vec::with_capacity(registries.len());
        for registry in registries {
            let value = qualify(&format!("{}/{}", registry, short_name))?;
            let cache = self.cache.clone();
            let key = short_name.to_string();
            let repository = value.name();
            candidates.push(
                PullCandidate::new(value).with_recorder(move || cache.record(&key, &repository)),
            );
        }

        Ok(Resolved {
            description: format!(
                "Resolving {:?} using unqualified-search registries ({})",
                short_name,
                registries.join(", ")
            ),
            candidates,
        })
    }
}
