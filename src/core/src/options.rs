//! Immutable per-operation transfer options.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackoffStrategy, TransferConfig};
use crate::error::{BundleError, Result};
use crate::progress::ProgressSink;

/// Snapshot of transfer settings for one push or pull.
///
/// Built before the operation starts and shared read-only afterwards.
#[derive(Clone)]
pub struct TransferOptions {
    max_retries: u32,
    retry_delay: Duration,
    backoff: BackoffStrategy,
    max_backoff: Duration,
    jitter: bool,
    timeout: Option<Duration>,
    max_concurrency: usize,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("backoff", &self.backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options mirroring a transfer config section, without a progress sink.
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            backoff: config.backoff,
            max_backoff: config.max_backoff(),
            jitter: config.jitter,
            timeout: config.timeout(),
            max_concurrency: config.max_concurrency,
            progress: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        if self.max_backoff < delay {
            self.max_backoff = delay;
        }
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn progress(&self) -> Option<&Arc<dyn ProgressSink>> {
        self.progress.as_ref()
    }

    /// Validate once at operation entry.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(BundleError::InvalidOption(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(BundleError::InvalidOption(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff < self.retry_delay {
            return Err(BundleError::InvalidOption(format!(
                "max_backoff ({:?}) is smaller than retry_delay ({:?})",
                self.max_backoff, self.retry_delay
            )));
        }
        Ok(())
    }

    /// Base wait before retry number `attempt` (1-based), before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.retry_delay,
            BackoffStrategy::Linear => self.retry_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.retry_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_linear_backoff() {
        let opts = TransferOptions::new().with_retry_delay(ms(100));
        assert_eq!(opts.backoff_delay(1), ms(100));
        assert_eq!(opts.backoff_delay(2), ms(200));
        assert_eq!(opts.backoff_delay(3), ms(300));
    }

    #[test]
    fn test_fixed_backoff() {
        let opts = TransferOptions::new()
            .with_retry_delay(ms(250))
            .with_backoff(BackoffStrategy::Fixed);
        assert_eq!(opts.backoff_delay(1), ms(250));
        assert_eq!(opts.backoff_delay(7), ms(250));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let opts = TransferOptions::new()
            .with_retry_delay(ms(100))
            .with_backoff(BackoffStrategy::Exponential)
            .with_max_backoff(ms(1000));
        assert_eq!(opts.backoff_delay(1), ms(100));
        assert_eq!(opts.backoff_delay(2), ms(200));
        assert_eq!(opts.backoff_delay(4), ms(800));
        assert_eq!(opts.backoff_delay(5), ms(1000));
        assert_eq!(opts.backoff_delay(64), ms(1000));
    }

    #[test]
    fn test_from_config() {
        let config = TransferConfig {
            max_retries: 7,
            timeout_ms: Some(5000),
            ..Default::default()
        };
        let opts = TransferOptions::from_config(&config);
        assert_eq!(opts.max_retries(), 7);
        assert_eq!(opts.timeout(), Some(Duration::from_secs(5)));
        assert!(opts.progress().is_none());
    }

    #[test]
    fn test_validate() {
        assert!(TransferOptions::new().validate().is_ok());
        assert!(TransferOptions::new()
            .with_max_concurrency(0)
            .validate()
            .is_err());
        assert!(TransferOptions::new()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());

        let err = TransferOptions::new()
            .with_max_backoff(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
        assert!(err.to_string().contains("max_backoff"));
        // raising the delay lifts the cap with it
        assert!(TransferOptions::new()
            .with_max_backoff(ms(10))
            .with_retry_delay(ms(500))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_debug_hides_sink() {
        let opts = TransferOptions::new().with_progress(Arc::new(|_: u64, _: Option<u64>| {}));
        assert!(format!("{:?}", opts).contains("progress: true"));
    }
}
