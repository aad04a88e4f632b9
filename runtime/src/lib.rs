//! imgflow runtime - image pull policy engine and multi-image export.
//!
//! This crate provides the [`ImageRuntime`] engine together with the
//! collaborators it drives: a disk-backed image store, registry and
//! archive transports, and short-name resolution.

#![allow(clippy::result_large_err)]

pub mod image;
pub mod oci;

// Re-export common types
pub use image::{check_platform, ImageRuntime, PullOptions, SaveOptions, SystemContext};
pub use oci::{
    CandidateResolver, CopyOptions, DiskStore, ImageRef, ImageReference, LocalImage, LocalStore,
    SaveFormat, Transport, TransportKind,
};

/// imgflow runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
