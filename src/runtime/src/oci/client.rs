//! High-level bundle client.
//!
//! Combines the packer, transfer engine and extraction guard into
//! directory-to-registry and registry-to-directory workflows. A pull is
//! complete and verified before extraction starts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use a3s_bundle_core::config::{BundleConfig, ExtractionPolicy};
use a3s_bundle_core::error::Result;
use a3s_bundle_core::options::TransferOptions;
use a3s_bundle_core::progress::ProgressSink;
use tokio_util::sync::CancellationToken;

use super::extract::{ExtractionGuard, ExtractionReport};
use super::manifest::{Bundle, ManifestBuilder, Platform};
use super::pack::Packer;
use super::transfer::{PushReport, TransferEngine};
use super::transport::RegistryTransport;

/// Result of [`BundleClient::pull_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub reference: String,
    pub manifest_digest: String,
    pub platform: Option<Platform>,
    pub annotations: BTreeMap<String, String>,
    pub extraction: ExtractionReport,
}

/// Pushes directories to and pulls them from a registry.
pub struct BundleClient {
    transport: Arc<dyn RegistryTransport>,
    packer: Packer,
    options: TransferOptions,
    policy: ExtractionPolicy,
    cancel: CancellationToken,
}

impl BundleClient {
    /// Create a client; the configuration is validated here.
    pub fn new(transport: Arc<dyn RegistryTransport>, config: &BundleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            packer: Packer::new(config.pack.clone()),
            options: TransferOptions::from_config(&config.transfer),
            policy: config.extraction.clone(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.options = self.options.with_progress(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_extraction_policy(mut self, policy: ExtractionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn extraction_policy(&self) -> &ExtractionPolicy {
        &self.policy
    }

    fn engine(&self) -> Result<TransferEngine> {
        Ok(
            TransferEngine::new(self.transport.clone(), self.options.clone())?
                .with_cancellation(self.cancel.clone()),
        )
    }

    /// Pack `source` and push it under `reference`.
    pub async fn push_dir(
        &self,
        reference: &str,
        source: impl AsRef<Path>,
        builder: ManifestBuilder,
    ) -> Result<PushReport> {
        let source = source.as_ref();
        let packed = self.packer.pack(source)?;
        tracing::info!(
            source = %source.display(),
            files = packed.file_count(),
            bytes = packed.content_size(),
            "Packed directory"
        );

        let bundle = builder.build(packed)?;
        self.engine()?.push(reference, &bundle).await
    }

    /// Pull a complete, verified bundle without extracting it.
    pub async fn pull(&self, reference: &str) -> Result<Bundle> {
        self.engine()?.pull(reference).await
    }

    /// Pull `reference` and extract it into `dest`.
    ///
    /// Layer sizes are checked against the extraction quotas before any
    /// layer is downloaded.
    pub async fn pull_dir(&self, reference: &str, dest: impl AsRef<Path>) -> Result<PullReport> {
        let guard = ExtractionGuard::new(dest, &self.policy)?;
        let bundle = self
            .engine()?
            .pull_checked(reference, |index, layers| guard.check_layers(index.layout, layers))
            .await?;
        let extraction = guard.extract(&bundle)?;

        Ok(PullReport {
            reference: reference.to_string(),
            manifest_digest: bundle.manifest().digest()?,
            platform: bundle.platform(),
            annotations: bundle.annotations().clone(),
            extraction,
        })
    }
}
