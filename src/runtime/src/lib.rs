//! A3S Bundle Runtime - directory bundles over OCI registries.
//!
//! Packs directory trees into content-addressed OCI artifacts, pushes and
//! pulls them with bounded retry, and extracts them under a guard that
//! enforces quotas and keeps every write inside the destination.
//!
//! ```no_run
//! use std::sync::Arc;
//! use a3s_bundle_core::BundleConfig;
//! use a3s_bundle_runtime::{BundleClient, ManifestBuilder, OciRegistryTransport, RegistryAuth};
//!
//! # async fn run() -> a3s_bundle_core::Result<()> {
//! let transport = Arc::new(OciRegistryTransport::with_auth(RegistryAuth::from_env()));
//! let client = BundleClient::new(transport, &BundleConfig::default())?;
//!
//! client
//!     .push_dir("ghcr.io/a3s-lab/models:v1", "./models", ManifestBuilder::new())
//!     .await?;
//! client.pull_dir("ghcr.io/a3s-lab/models:v1", "./restored").await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{extract_bundle, ExtractionGuard, ExtractionReport};
pub use oci::{BundleClient, PullReport, PushReport, TransferEngine};
pub use oci::{Bundle, BundleEntry, BundleManifest, EntryKind, ManifestBuilder, Platform};
pub use oci::{MemoryTransport, OciRegistryTransport, RegistryAuth, RegistryTransport};
pub use oci::{PackedBundle, Packer};

/// A3S Bundle Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
