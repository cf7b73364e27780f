//! OCI artifact support for A3S Bundle.
//!
//! A directory tree travels through a registry as an OCI artifact:
//!
//! - packing a directory into deterministic entries and blobs
//! - describing them with a manifest and a bundle index
//! - transferring blobs and manifests with retry and cancellation
//! - extracting a pulled bundle under quota and path policy
//!
//! # Artifact layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bundle Manifest                           │
//! │                                                              │
//! │  artifactType: application/vnd.a3s.bundle.v1                 │
//! │  config  ─► bundle index (layout, platform, entries)         │
//! │  layers  ─► files:   one blob per distinct file content      │
//! │             archive: one tar+gzip blob                       │
//! │  annotations (org.opencontainers.image.*)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod client;
pub mod digest;
pub mod entry;
mod extract;
pub mod manifest;
mod pack;
pub mod registry;
mod transfer;
pub mod transport;

pub use client::{BundleClient, PullReport};
pub use entry::{BundleEntry, EntryKind};
pub use extract::{extract_bundle, ExtractionGuard, ExtractionReport};
pub use manifest::{
    annotations, Blob, Bundle, BundleIndex, BundleManifest, Descriptor, ManifestBuilder, Platform,
};
pub use pack::{PackedBundle, Packer};
pub use registry::{OciRegistryTransport, RegistryAuth};
pub use transfer::{PushReport, TransferEngine, TransferPhase};
pub use transport::{MemoryTransport, RegistryTransport};
