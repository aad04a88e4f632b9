//! The image engine: pull policy and candidate waterfall, multi-image
//! export, and the advisory platform check.
//!
//! [`ImageRuntime`] owns no state of its own beyond its collaborators; every
//! operation awaits them strictly one after another.

mod platform;
mod pull;
mod save;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use imgflow_core::config::EngineConfig;
use imgflow_core::error::Result;
use imgflow_core::event::{EventEmitter, ImageEvent};
use imgflow_core::platform::PlatformSpec;

use crate::oci::copier::DefaultTransport;
use crate::oci::registry::RegistryClient;
use crate::oci::shortnames::{CandidateResolver, SearchRegistriesResolver};
use crate::oci::store::{DiskStore, LocalStore};
use crate::oci::transport::Transport;

pub use platform::check_platform;
pub use pull::PullOptions;
pub use save::SaveOptions;

/// Settings shared by every operation of a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemContext {
    /// Platform choice applied to pulls that request none
    pub platform: PlatformSpec,
}

/// Retry defaults for registry copies.
#[derive(Debug, Clone, Copy, Default)]
struct RetryDefaults {
    max_retries: u32,
    retry_delay: Option<Duration>,
}

/// Image engine over a store, a resolver and a transport.
pub struct ImageRuntime {
    store: Arc<dyn LocalStore>,
    resolver: Arc<dyn CandidateResolver>,
    transport: Arc<dyn Transport>,
    events: Option<EventEmitter>,
    system_context: SystemContext,
    retry: RetryDefaults,
}

impl ImageRuntime {
    pub fn new(
        store: Arc<dyn LocalStore>,
        resolver: Arc<dyn CandidateResolver>,
        transport: Arc<dyn Transport>,
        system_context: SystemContext,
    ) -> Self {
        Self {
            store,
            resolver,
            transport,
            events: None,
            system_context,
            retry: RetryDefaults::default(),
        }
    }

    /// Deliver image events to `events`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Retry defaults for pulls that do not set their own.
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Option<Duration>) -> Self {
        self.retry = RetryDefaults {
            max_retries,
            retry_delay,
        };
        self
    }

    /// Runtime with the default disk store, registry client and resolver.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = Arc::new(RegistryClient::default());
        let store = Arc::new(DiskStore::open(&config.store_root, registry)?);
        let transport = Arc::new(DefaultTransport::new(store.clone()));
        let resolver = Arc::new(SearchRegistriesResolver::new(config.registries.clone()));

        tracing::debug!(
            store_root = %config.store_root.display(),
            platform = %config.platform,
            "Image runtime configured"
        );

        let mut runtime = Self::new(
            store,
            resolver,
            transport,
            SystemContext {
                platform: config.platform.clone(),
            },
        )
        .with_retry(config.retry.max_retries, config.retry.delay()?);
        if config.events.capacity > 0 {
            runtime = runtime.with_events(EventEmitter::new(config.events.capacity));
        }
        Ok(runtime)
    }

    /// The event emitter, if events are enabled.
    pub fn events(&self) -> Option<&EventEmitter> {
        self.events.as_ref()
    }

    pub fn system_context(&self) -> &SystemContext {
        &self.system_context
    }

    fn emit(&self, event: ImageEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}
