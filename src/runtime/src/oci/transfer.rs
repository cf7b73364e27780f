//! Transfer engine.
//!
//! Pushes and pulls bundles through a [`RegistryTransport`], retrying each
//! blob or manifest independently:
//!
//! ```text
//! Pending → Attempting → Succeeded
//!               │
//!               ├─ transient error, budget left → RetryScheduled → Attempting
//!               └─ otherwise ───────────────────→ Failed
//! ```
//!
//! Every transport call and every backoff wait is raced against the
//! engine's cancellation token. Push uploads all layers and the config blob
//! before the manifest; pull fetches the manifest, then the config, then the
//! layers.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a3s_bundle_core::config::PackLayout;
use a3s_bundle_core::error::{BundleError, Result};
use a3s_bundle_core::options::TransferOptions;
use a3s_bundle_core::progress::ProgressSink;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::entry::EntryKind;
use super::manifest::{Blob, Bundle, BundleIndex, Descriptor};
use super::transport::RegistryTransport;

/// Lifecycle of one blob or manifest transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Pending,
    Attempting,
    RetryScheduled,
    Succeeded,
    Failed,
}

/// State of a single transfer unit, owned by the future driving it.
#[derive(Debug)]
struct TransferState {
    phase: TransferPhase,
    attempts: u32,
    bytes: u64,
    last_error: Option<BundleError>,
}

impl TransferState {
    fn new() -> Self {
        Self {
            phase: TransferPhase::Pending,
            attempts: 0,
            bytes: 0,
            last_error: None,
        }
    }

    fn begin_attempt(&mut self) {
        self.phase = TransferPhase::Attempting;
        self.attempts += 1;
    }

    fn schedule_retry(&mut self, err: BundleError) {
        self.phase = TransferPhase::RetryScheduled;
        self.last_error = Some(err);
    }

    fn succeed(&mut self, bytes: u64) {
        self.phase = TransferPhase::Succeeded;
        self.bytes = bytes;
        self.last_error = None;
    }

    fn fail(&mut self, operation: &str, err: BundleError) -> BundleError {
        self.phase = TransferPhase::Failed;
        BundleError::TransferFailed {
            operation: operation.to_string(),
            attempts: self.attempts,
            source: Box::new(err),
        }
    }
}

/// Aggregate byte counter shared by concurrent transfers of one operation.
struct ProgressReporter {
    sink: Option<Arc<dyn ProgressSink>>,
    transferred: AtomicU64,
    total: Option<u64>,
}

impl ProgressReporter {
    fn new(sink: Option<Arc<dyn ProgressSink>>, total: Option<u64>) -> Self {
        Self {
            sink,
            transferred: AtomicU64::new(0),
            total,
        }
    }

    /// Record `bytes` more and notify the sink. A panicking sink is logged
    /// and otherwise ignored.
    fn advance(&self, bytes: u64) {
        let current = self.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(sink) = &self.sink {
            let total = self.total;
            let notified = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.on_progress(current, total)
            }));
            if notified.is_err() {
                tracing::warn!(current, total = ?total, "Progress sink panicked");
            }
        }
    }

    fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub reference: String,
    /// Digest of the canonical manifest encoding
    pub manifest_digest: String,
    /// Location returned by the registry
    pub manifest_url: String,
    /// Distinct blobs uploaded, config included
    pub blobs: usize,
    /// Layer bytes uploaded
    pub bytes: u64,
    /// Transport calls made, retries included
    pub attempts: u32,
}

/// Pushes and pulls bundles with retry, timeout, cancellation and progress.
pub struct TransferEngine {
    transport: Arc<dyn RegistryTransport>,
    options: TransferOptions,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TransferEngine {
    /// Create an engine; the options are validated here.
    pub fn new(transport: Arc<dyn RegistryTransport>, options: TransferOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            transport,
            options,
            cancel: CancellationToken::new(),
            deadline: None,
        })
    }

    /// Abort operations when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Abort operations still running at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Push every blob of `bundle`, then its manifest.
    pub async fn push(&self, reference: &str, bundle: &Bundle) -> Result<PushReport> {
        self.options.validate()?;
        self.guard_deadline("push", self.push_inner(reference, bundle))
            .await
    }

    /// Pull the manifest and every blob it references.
    ///
    /// The returned bundle is complete: every layer is verified against its
    /// descriptor and every entry resolves.
    pub async fn pull(&self, reference: &str) -> Result<Bundle> {
        self.pull_checked(reference, |_, _| Ok(())).await
    }

    /// Pull `reference`, letting `check` refuse the bundle from its index
    /// and layer descriptors before any layer is fetched.
    pub async fn pull_checked<F>(&self, reference: &str, check: F) -> Result<Bundle>
    where
        F: FnOnce(&BundleIndex, &[Descriptor]) -> Result<()>,
    {
        self.options.validate()?;
        self.guard_deadline("pull", self.pull_inner(reference, check)).await
    }

    async fn push_inner(&self, reference: &str, bundle: &Bundle) -> Result<PushReport> {
        let attempts = AtomicU32::new(0);

        let mut seen = HashSet::new();
        let layers: Vec<&Blob> = bundle
            .layers()
            .iter()
            .filter(|blob| seen.insert(blob.digest()))
            .collect();
        let total: u64 = layers.iter().map(|b| b.size()).sum();
        let reporter = ProgressReporter::new(self.options.progress().cloned(), Some(total));

        tracing::info!(
            reference = %reference,
            layers = layers.len(),
            bytes = total,
            "Pushing bundle"
        );

        stream::iter(
            layers
                .iter()
                .map(|blob| self.push_blob(reference, blob, &attempts, Some(&reporter))),
        )
        .buffer_unordered(self.options.max_concurrency())
        .try_collect::<Vec<()>>()
        .await?;

        self.push_blob(reference, bundle.config(), &attempts, None)
            .await?;

        let manifest = bundle.manifest();
        let manifest_url = self
            .run_unit(&format!("push manifest {}", reference), 0, &attempts, || {
                self.transport.put_manifest(reference, manifest)
            })
            .await?;

        let report = PushReport {
            reference: reference.to_string(),
            manifest_digest: manifest.digest()?,
            manifest_url,
            blobs: layers.len() + 1,
            bytes: reporter.transferred(),
            attempts: attempts.load(Ordering::Acquire),
        };

        tracing::info!(
            reference = %reference,
            digest = %report.manifest_digest,
            bytes = report.bytes,
            attempts = report.attempts,
            "Bundle pushed"
        );

        Ok(report)
    }

    async fn push_blob(
        &self,
        reference: &str,
        blob: &Blob,
        attempts: &AtomicU32,
        reporter: Option<&ProgressReporter>,
    ) -> Result<()> {
        let operation = format!("push blob {}", blob.digest());
        self.run_unit(&operation, blob.size(), attempts, || {
            self.transport.put_blob(reference, blob.digest(), blob.data())
        })
        .await?;

        if let Some(reporter) = reporter {
            reporter.advance(blob.size());
        }
        Ok(())
    }

    async fn pull_inner<F>(&self, reference: &str, check: F) -> Result<Bundle>
    where
        F: FnOnce(&BundleIndex, &[Descriptor]) -> Result<()>,
    {
        let attempts = AtomicU32::new(0);

        tracing::info!(reference = %reference, "Pulling bundle");

        let manifest = self
            .run_unit(&format!("pull manifest {}", reference), 0, &attempts, || {
                self.transport.get_manifest(reference)
            })
            .await?;
        manifest.validate()?;

        let config = self
            .pull_blob(reference, &manifest.config, &attempts, None)
            .await?;
        let index: BundleIndex = serde_json::from_slice(config.data()).map_err(|e| {
            BundleError::NonTransientTransport {
                operation: format!("pull {}", reference),
                message: format!("malformed bundle index: {}", e),
            }
        })?;
        check_resolvable(reference, &index, &manifest.layers)?;
        check(&index, &manifest.layers)?;

        let total: u64 = manifest.layers.iter().map(|d| d.size).sum();
        let reporter = ProgressReporter::new(self.options.progress().cloned(), Some(total));

        let layers: Vec<Blob> = stream::iter(
            manifest
                .layers
                .iter()
                .map(|descriptor| self.pull_blob(reference, descriptor, &attempts, Some(&reporter))),
        )
        .buffered(self.options.max_concurrency())
        .try_collect()
        .await?;

        tracing::info!(
            reference = %reference,
            layers = layers.len(),
            bytes = reporter.transferred(),
            attempts = attempts.load(Ordering::Acquire),
            "Bundle pulled"
        );

        Bundle::from_parts(manifest, config, layers)
    }

    async fn pull_blob(
        &self,
        reference: &str,
        descriptor: &Descriptor,
        attempts: &AtomicU32,
        reporter: Option<&ProgressReporter>,
    ) -> Result<Blob> {
        let operation = format!("pull blob {}", descriptor.digest);
        let blob = self
            .run_unit(&operation, descriptor.size, attempts, || async move {
                let data = self.transport.get_blob(reference, &descriptor.digest).await?;
                Blob::from_descriptor(descriptor, data)
            })
            .await?;

        if let Some(reporter) = reporter {
            reporter.advance(blob.size());
        }
        Ok(blob)
    }

    /// Drive one transfer unit through its state machine.
    async fn run_unit<T, F, Fut>(
        &self,
        operation: &str,
        size: u64,
        attempts: &AtomicU32,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = TransferState::new();

        loop {
            state.begin_attempt();
            attempts.fetch_add(1, Ordering::AcqRel);

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(canceled(operation)),
                result = self.call_with_timeout(operation, call()) => result,
            };

            match outcome {
                Ok(value) => {
                    if let Some(previous) = &state.last_error {
                        tracing::debug!(
                            operation,
                            attempts = state.attempts,
                            error = %previous,
                            "Transfer recovered after retry"
                        );
                    }
                    state.succeed(size);
                    tracing::trace!(
                        operation,
                        phase = ?state.phase,
                        attempts = state.attempts,
                        bytes = state.bytes,
                        "Transfer succeeded"
                    );
                    return Ok(value);
                }
                Err(err @ BundleError::Canceled(_)) => {
                    state.phase = TransferPhase::Failed;
                    return Err(err);
                }
                Err(err) if err.is_retryable() && state.attempts <= self.options.max_retries() => {
                    let delay = self.backoff_delay(state.attempts);
                    tracing::warn!(
                        operation,
                        error = %err,
                        attempt = state.attempts,
                        max_retries = self.options.max_retries(),
                        backoff_ms = delay.as_millis() as u64,
                        "Retrying transfer"
                    );
                    state.schedule_retry(err);

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            state.phase = TransferPhase::Failed;
                            return Err(canceled(operation));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    let err = state.fail(operation, err);
                    tracing::warn!(operation, phase = ?state.phase, error = %err, "Transfer failed");
                    return Err(err);
                }
            }
        }
    }

    async fn call_with_timeout<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.options.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                Err(BundleError::TransientTransport {
                    operation: operation.to_string(),
                    message: format!("timed out after {:?}", timeout),
                })
            }),
            None => call.await,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.options.backoff_delay(attempt);
        if !self.options.jitter() || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    async fn guard_deadline<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .unwrap_or_else(|_| {
                    Err(BundleError::Canceled(format!(
                        "{}: deadline exceeded",
                        operation
                    )))
                }),
            None => fut.await,
        }
    }
}

fn canceled(operation: &str) -> BundleError {
    BundleError::Canceled(format!("{}: operation canceled", operation))
}

/// Every file entry of a files-layout bundle must map to a manifest layer.
fn check_resolvable(reference: &str, index: &BundleIndex, layers: &[Descriptor]) -> Result<()> {
    if index.layout != PackLayout::Files {
        return Ok(());
    }
    let digests: HashSet<&str> = layers.iter().map(|d| d.digest.as_str()).collect();
    for entry in index.entries.iter().filter(|e| e.kind == EntryKind::File) {
        let resolved = entry
            .digest
            .as_deref()
            .map_or(false, |d| digests.contains(d));
        if !resolved {
            return Err(BundleError::NonTransientTransport {
                operation: format!("pull {}", reference),
                message: format!(
                    "entry '{}' references content missing from the manifest",
                    entry.path
                ),
            });
        }
    }
    Ok(())
}
