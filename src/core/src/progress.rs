//! Transfer progress reporting.
//!
//! A sink receives `(current, total)` byte counts. Sinks must return quickly;
//! they are invoked inline on the transfer path. `total` is `None` when the
//! registry did not report a size ahead of the transfer.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Receiver of transfer progress updates.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, current: u64, total: Option<u64>);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, current: u64, total: Option<u64>) {
        self(current, total)
    }
}

/// A single progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current: u64,
    pub total: Option<u64>,
}

/// Forwards updates into an unbounded channel. Never blocks; updates are
/// dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, current: u64, total: Option<u64>) {
        let _ = self.sender.send(ProgressUpdate { current, total });
    }
}

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Keeps the latest update for polling.
#[derive(Debug)]
pub struct ProgressCounter {
    current: AtomicU64,
    total: AtomicU64,
    updates: AtomicU64,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self {
            current: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            updates: AtomicU64::new(0),
        }
    }
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes reported by the latest update.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Total reported by the latest update, if known.
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    /// Number of updates received.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

impl ProgressSink for ProgressCounter {
    fn on_progress(&self, current: u64, total: Option<u64>) {
        // Concurrent blob completions may report out of order; keep the maximum.
        self.current.fetch_max(current, Ordering::AcqRel);
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Release);
        self.updates.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let sink = move |current: u64, _total: Option<u64>| {
            seen_clone.store(current, Ordering::SeqCst);
        };
        sink.on_progress(42, Some(100));
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_channel_progress() {
        let (sink, mut rx) = ChannelProgress::new();
        sink.on_progress(10, Some(30));
        sink.on_progress(30, Some(30));
        assert_eq!(
            rx.recv().await,
            Some(ProgressUpdate {
                current: 10,
                total: Some(30)
            })
        );
        assert_eq!(rx.recv().await.unwrap().current, 30);
    }

    #[test]
    fn test_channel_progress_receiver_dropped() {
        let (sink, rx) = ChannelProgress::new();
        drop(rx);
        sink.on_progress(1, None);
    }

    #[test]
    fn test_progress_counter() {
        let counter = ProgressCounter::new();
        assert_eq!(counter.total(), None);
        counter.on_progress(20, Some(30));
        counter.on_progress(10, Some(30));
        assert_eq!(counter.current(), 20);
        assert_eq!(counter.total(), Some(30));
        assert_eq!(counter.updates(), 2);
        counter.on_progress(25, None);
        assert_eq!(counter.total(), None);
    }
}
