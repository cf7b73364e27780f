//! Registry transport contract.
//!
//! The transfer engine only talks to registries through this trait. The
//! reference string is opaque here; implementations parse it.
//! Implementations classify failures: network errors and 5xx responses are
//! `TransientTransport`, authentication and other 4xx responses are
//! `NonTransientTransport`, missing references are `NotFound`.
//!
//! Cancellation is by dropping the returned future; the engine races every
//! call against its cancellation token and timeout.

use std::collections::HashMap;

use a3s_bundle_core::error::{BundleError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::digest::verify_digest;
use super::manifest::BundleManifest;

#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Upload a blob. Repeating the upload of the same digest is harmless.
    async fn put_blob(&self, reference: &str, digest: &str, content: &[u8]) -> Result<()>;

    /// Download a blob by digest.
    async fn get_blob(&self, reference: &str, digest: &str) -> Result<Vec<u8>>;

    /// Upload a manifest, returning its location.
    async fn put_manifest(&self, reference: &str, manifest: &BundleManifest) -> Result<String>;

    /// Download the manifest a reference points to.
    async fn get_manifest(&self, reference: &str) -> Result<BundleManifest>;
}

/// Registry held in process memory.
///
/// Blobs are shared across references, like a registry's content store.
/// Useful for tests and for wiring pipelines without a network.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    manifests: RwLock<HashMap<String, BundleManifest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn contains_blob(&self, digest: &str) -> bool {
        self.blobs.read().contains_key(digest)
    }

    /// Manifest stored under `reference`, if any.
    pub fn manifest(&self, reference: &str) -> Option<BundleManifest> {
        self.manifests.read().get(reference).cloned()
    }

    /// Store a manifest without checking its blobs.
    pub fn insert_manifest(&self, reference: &str, manifest: BundleManifest) {
        self.manifests.write().insert(reference.to_string(), manifest);
    }

    /// Store raw bytes under `digest` without verification.
    pub fn insert_blob(&self, digest: &str, content: Vec<u8>) {
        self.blobs.write().insert(digest.to_string(), content);
    }
}

#[async_trait]
impl RegistryTransport for MemoryTransport {
    async fn put_blob(&self, _reference: &str, digest: &str, content: &[u8]) -> Result<()> {
        verify_digest(digest, content).map_err(|e| BundleError::NonTransientTransport {
            operation: format!("put blob {}", digest),
            message: e.to_string(),
        })?;
        self.blobs
            .write()
            .entry(digest.to_string())
            .or_insert_with(|| content.to_vec());
        Ok(())
    }

    async fn get_blob(&self, _reference: &str, digest: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| BundleError::NotFound(format!("blob {}", digest)))
    }

    async fn put_manifest(&self, reference: &str, manifest: &BundleManifest) -> Result<String> {
        let missing = std::iter::once(&manifest.config)
            .chain(&manifest.layers)
            .find(|d| !self.contains_blob(&d.digest));
        if let Some(descriptor) = missing {
            return Err(BundleError::NonTransientTransport {
                operation: format!("put manifest {}", reference),
                message: format!("blob unknown to registry: {}", descriptor.digest),
            });
        }

        let digest = manifest.digest()?;
        self.insert_manifest(reference, manifest.clone());
        Ok(format!("memory://{}@{}", reference, digest))
    }

    async fn get_manifest(&self, reference: &str) -> Result<BundleManifest> {
        self.manifest(reference)
            .ok_or_else(|| BundleError::NotFound(format!("manifest {}", reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::digest::sha256_digest;
    use crate::oci::manifest::ManifestBuilder;
    use crate::oci::pack::Packer;
    use a3s_bundle_core::error::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_blob_round_trip() {
        let transport = MemoryTransport::new();
        let digest = sha256_digest(b"hello");

        transport.put_blob("r", &digest, b"hello").await.unwrap();
        transport.put_blob("r", &digest, b"hello").await.unwrap();

        assert_eq!(transport.blob_count(), 1);
        assert_eq!(transport.get_blob("other", &digest).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_memory_rejects_wrong_digest() {
        let transport = MemoryTransport::new();
        let err = transport
            .put_blob("r", &sha256_digest(b"hello"), b"bye")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransientTransport);
        assert_eq!(transport.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_missing_is_not_found() {
        let transport = MemoryTransport::new();
        let err = transport.get_manifest("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = transport.get_blob("nope", "sha256:00").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_memory_manifest_requires_blobs() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        let bundle = ManifestBuilder::new()
            .build(Packer::default().pack(src.path()).unwrap())
            .unwrap();
        let transport = MemoryTransport::new();

        let err = transport
            .put_manifest("r", bundle.manifest())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTransientTransport);

        for blob in bundle.layers().iter().chain(std::iter::once(bundle.config())) {
            transport
                .put_blob("r", blob.digest(), blob.data())
                .await
                .unwrap();
        }
        let url = transport.put_manifest("r", bundle.manifest()).await.unwrap();
        assert!(url.starts_with("memory://r@sha256:"));
        assert_eq!(transport.manifest("r").as_ref(), Some(bundle.manifest()));
    }
}
