//! A3S Bundle Core - Foundational Types
//!
//! Error taxonomy, configuration, transfer options and progress reporting
//! shared by the bundle runtime.

pub mod config;
pub mod error;
pub mod log;
pub mod options;
pub mod progress;

// Re-export commonly used types
pub use config::{
    BackoffStrategy, BundleConfig, ExternalSymlinks, ExtractionPolicy, PackConfig, PackLayout,
    TransferConfig, UnmatchedPrefix,
};
pub use error::{BundleError, ErrorKind, Result};
pub use log::{init_tracing, LogConfig, LogFormat};
pub use options::TransferOptions;
pub use progress::{ChannelProgress, ProgressCounter, ProgressSink, ProgressUpdate};

/// A3S Bundle version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
