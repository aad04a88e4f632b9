//! imgflow Core - Foundational Types
//!
//! This crate provides the types shared by the imgflow engine and its
//! front-ends: the error taxonomy, image events, pull policy, platform
//! description and engine configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod platform;
pub mod policy;

// Re-export commonly used types
pub use config::{EngineConfig, LogLevel, RegistriesConfig, RetryConfig};
pub use error::{chain_cleanup, ImageError, PullErrors, Result};
pub use event::{EventEmitter, ImageEvent, ImageEventKind};
pub use platform::PlatformSpec;
pub use policy::PullPolicy;

/// imgflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
