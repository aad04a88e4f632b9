//! OCI image plumbing for the engine.
//!
//! Everything the engine treats as a collaborator lives here: reference
//! parsing, transports and copiers, the local image store, short-name
//! resolution, and archive assembly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   resolve    ┌─────────────────────────┐
//! │ ImageRuntime │─────────────▶│ SearchRegistriesResolver │
//! │              │              └─────────────────────────┘
//! │              │   copy       ┌──────────────────┐  pull   ┌────────────────┐
//! │              │─────────────▶│ DefaultTransport │────────▶│ RegistryClient │
//! │              │              │  └ LocalCopier   │         └────────────────┘
//! │              │              └────────┬─────────┘
//! │              │   lookup              │ commit / load
//! │              │─────────────▶┌────────▼─────────┐
//! └──────────────┘              │    DiskStore     │
//!                               │  <root>/images/  │
//!                               │  └── <id>/       │  (OCI layout per image)
//!                               └──────────────────┘
//! ```

pub mod archive;
pub mod copier;
pub mod credentials;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod shortnames;
pub mod store;
pub mod transport;

pub use archive::{ArchiveWriter, SaveFormat, TarArchiveWriter};
pub use copier::DefaultTransport;
pub use credentials::CredentialStore;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryClient};
pub use shortnames::{CandidateResolver, PullCandidate, Resolved, SearchRegistriesResolver};
pub use store::{DiskStore, LocalImage, LocalStore, LookupOptions, StoredImage};
pub use transport::{Copier, CopyOptions, ImageRef, ManifestType, SourceInfo, Transport, TransportKind};
