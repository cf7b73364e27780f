//! Bundle configuration.
//!
//! Every section is a plain serde struct with documented defaults, so a
//! configuration can be loaded from YAML, built in code, or mixed. Values are
//! validated once when an operation starts, never during it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BundleError, Result};
use crate::log::LogConfig;

/// Default maximum number of entries materialized by one extraction.
pub const DEFAULT_MAX_FILES: u64 = 10_000;

/// Default maximum total bytes written by one extraction: 1 GiB.
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Default maximum size of a single extracted file: 512 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Top-level bundle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Retry, timeout and concurrency settings for registry transfers
    pub transfer: TransferConfig,

    /// Quotas and filesystem policy applied when unpacking
    pub extraction: ExtractionPolicy,

    /// How directories are turned into blobs
    pub pack: PackConfig,

    /// Tracing subscriber settings
    pub log: LogConfig,
}

impl BundleConfig {
    /// Parse a configuration from a YAML document.
    ///
    /// Missing sections and fields take their defaults. Malformed values
    /// (including negative quotas) are reported as `InvalidOption`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BundleConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BundleError::InvalidOption(format!("Invalid bundle config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| BundleError::io(path, e))?;
        let config = Self::from_yaml_str(&yaml)?;
        tracing::debug!(path = %path.display(), "Loaded bundle config");
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        self.extraction.validate()?;
        self.pack.validate()
    }
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `retry_delay * attempt`
    #[default]
    Linear,
    /// `retry_delay` before every retry
    Fixed,
    /// `retry_delay * 2^(attempt - 1)`
    Exponential,
}

/// Registry transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Backoff base in milliseconds
    pub retry_delay_ms: u64,

    /// Backoff growth strategy
    pub backoff: BackoffStrategy,

    /// Upper bound for a single backoff wait in milliseconds
    pub max_backoff_ms: u64,

    /// Randomize each wait by ±10%
    pub jitter: bool,

    /// Per-call timeout in milliseconds (none by default)
    pub timeout_ms: Option<u64>,

    /// Blobs transferred concurrently within one push or pull
    pub max_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff: BackoffStrategy::Linear,
            max_backoff_ms: 30_000,
            jitter: false,
            timeout_ms: None,
            max_concurrency: 4,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(BundleError::InvalidOption(
                "transfer.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(BundleError::InvalidOption(
                "transfer.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.retry_delay_ms {
            return Err(BundleError::InvalidOption(format!(
                "transfer.max_backoff_ms ({}) is smaller than transfer.retry_delay_ms ({})",
                self.max_backoff_ms, self.retry_delay_ms
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// What to do with entries that do not start with the configured strip prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPrefix {
    /// Write the entry at its original path
    #[default]
    Keep,
    /// Leave the entry out, logging it
    Skip,
    /// Fail the extraction with a security violation
    Reject,
}

/// Quotas and filesystem policy for unpacking a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionPolicy {
    /// Maximum entries materialized (files, directories and symlinks)
    pub max_files: u64,

    /// Maximum cumulative bytes written
    pub max_size: u64,

    /// Maximum bytes of any single file
    pub max_file_size: u64,

    /// Apply recorded mode bits instead of sanitized defaults
    pub preserve_permissions: bool,

    /// Leading path removed from every entry before it is joined to the destination
    pub strip_prefix: Option<String>,

    /// Handling of entries outside `strip_prefix`
    pub unmatched_prefix: UnmatchedPrefix,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_size: DEFAULT_MAX_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            preserve_permissions: false,
            strip_prefix: None,
            unmatched_prefix: UnmatchedPrefix::Keep,
        }
    }
}

impl ExtractionPolicy {
    pub fn with_max_files(mut self, max_files: u64) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    pub fn with_unmatched_prefix(mut self, unmatched: UnmatchedPrefix) -> Self {
        self.unmatched_prefix = unmatched;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_files", self.max_files),
            ("max_size", self.max_size),
            ("max_file_size", self.max_file_size),
        ] {
            if value == 0 {
                return Err(BundleError::InvalidOption(format!(
                    "extraction.{} must be greater than 0",
                    name
                )));
            }
        }

        if let Some(prefix) = &self.strip_prefix {
            if prefix.starts_with('/') || prefix.starts_with('\\') {
                return Err(BundleError::InvalidOption(format!(
                    "extraction.strip_prefix must be relative: '{}'",
                    prefix
                )));
            }
            let segments: Vec<&str> = prefix
                .split('/')
                .filter(|s| !s.is_empty() && *s != ".")
                .collect();
            if segments.is_empty() {
                return Err(BundleError::InvalidOption(
                    "extraction.strip_prefix must name at least one path segment".to_string(),
                ));
            }
            if segments.contains(&"..") {
                return Err(BundleError::InvalidOption(format!(
                    "extraction.strip_prefix must not contain '..': '{}'",
                    prefix
                )));
            }
        }

        Ok(())
    }
}

/// Blob layout produced by the packer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackLayout {
    /// One raw blob per distinct file content
    #[default]
    Files,
    /// A single deterministic tar+gzip layer
    Archive,
}

/// Handling of symlinks whose target leaves the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSymlinks {
    /// Abort the pack with a security violation
    #[default]
    Reject,
    /// Leave the symlink out, logging it
    Skip,
}

/// Packing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    pub layout: PackLayout,
    pub external_symlinks: ExternalSymlinks,
    /// gzip level (0-9) for the archive layout
    pub compression_level: u32,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            layout: PackLayout::Files,
            external_symlinks: ExternalSymlinks::Reject,
            compression_level: 6,
        }
    }
}

impl PackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(BundleError::InvalidOption(format!(
                "pack.compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = BundleConfig::default();
        assert_eq!(config.transfer.max_retries, 3);
        assert_eq!(config.transfer.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.transfer.backoff, BackoffStrategy::Linear);
        assert_eq!(config.extraction.max_files, DEFAULT_MAX_FILES);
        assert!(!config.extraction.preserve_permissions);
        assert_eq!(config.extraction.unmatched_prefix, UnmatchedPrefix::Keep);
        assert_eq!(config.pack.layout, PackLayout::Files);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
transfer:
  max_retries: 5
  backoff: exponential
extraction:
  max_files: 20
  strip_prefix: dist
  unmatched_prefix: reject
pack:
  layout: archive
"#;
        let config = BundleConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.transfer.max_retries, 5);
        assert_eq!(config.transfer.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.transfer.retry_delay_ms, 1000);
        assert_eq!(config.extraction.max_files, 20);
        assert_eq!(config.extraction.strip_prefix.as_deref(), Some("dist"));
        assert_eq!(config.extraction.unmatched_prefix, UnmatchedPrefix::Reject);
        assert_eq!(config.pack.layout, PackLayout::Archive);
    }

    #[test]
    fn test_from_yaml_negative_quota_is_invalid_option() {
        let yaml = "extraction:\n  max_size: -1\n";
        let err = BundleConfig::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
    }

    #[test]
    fn test_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bundle.yaml");
        std::fs::write(&path, "transfer:\n  max_concurrency: 2\n").unwrap();
        let config = BundleConfig::from_file(&path).unwrap();
        assert_eq!(config.transfer.max_concurrency, 2);
    }

    #[test]
    fn test_from_file_missing() {
        let err = BundleConfig::from_file("/nonexistent/bundle.yaml").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_zero_quota_rejected() {
        let policy = ExtractionPolicy::default().with_max_file_size(0);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("max_file_size"));
    }

    #[test]
    fn test_strip_prefix_validation() {
        assert!(ExtractionPolicy::default()
            .with_strip_prefix("dist/app")
            .validate()
            .is_ok());
        assert!(ExtractionPolicy::default()
            .with_strip_prefix("/abs")
            .validate()
            .is_err());
        assert!(ExtractionPolicy::default()
            .with_strip_prefix("a/../b")
            .validate()
            .is_err());
        assert!(ExtractionPolicy::default()
            .with_strip_prefix("./")
            .validate()
            .is_err());
    }

    #[test]
    fn test_transfer_validation() {
        let mut config = TransferConfig::default();
        config.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compression_level_validation() {
        let config = PackConfig {
            compression_level: 10,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidOption);
    }
}
