//! Save coordinator.
//!
//! Handlers call [`SaveCoordinator::trigger_save`] after mutations that
//! must survive restart. Triggers are coalesced: a flush happens after a
//! quiet window with no further triggers, or at a hard ceiling after the
//! first trigger of a burst. One flush runs at a time; triggers arriving
//! during a flush queue exactly one follow-up cycle. A failed flush is
//! logged and retried on the next trigger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use super::store::HotStore;

/// Default quiet window (500 ms).
pub const DEFAULT_QUIET: Duration = Duration::from_millis(500);

/// Default hard ceiling (5 s).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Debounced flush scheduling over the hot store.
pub struct SaveCoordinator {
    tx: mpsc::UnboundedSender<String>,
    flushes: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl SaveCoordinator {
    /// Spawn the coordinator task over a store.
    pub fn spawn(store: Arc<HotStore>, quiet: Duration, max_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let flushes = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_loop(
            store,
            rx,
            quiet,
            max_delay,
            flushes.clone(),
            failures.clone(),
        ));

        Self {
            tx,
            flushes,
            failures,
        }
    }

    pub fn with_defaults(store: Arc<HotStore>) -> Self {
        Self::spawn(store, DEFAULT_QUIET, DEFAULT_MAX_DELAY)
    }

    /// Request a flush. Returns immediately; the write happens on the
    /// coordinator task after debouncing.
    pub fn trigger_save(&self, reason: impl Into<String>) {
        // Send only fails when the coordinator task is gone (shutdown).
        let _ = self.tx.send(reason.into());
    }

    /// Completed flush count.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Failed flush count.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

async fn run_loop(
    store: Arc<HotStore>,
    mut rx: mpsc::UnboundedReceiver<String>,
    quiet: Duration,
    max_delay: Duration,
    flushes: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
) {
    while let Some(reason) = rx.recv().await {
        debug!(reason = %reason, "Save triggered");
        let deadline = Instant::now() + max_delay;
        let mut closed = false;

        // Debounce: each trigger restarts the quiet window, the ceiling
        // forces a flush regardless.
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(r) => {
                        debug!(reason = %r, "Save trigger coalesced");
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = sleep(quiet) => break,
                _ = sleep_until(deadline) => break,
            }
        }

        match store.flush().await {
            Ok(()) => {
                flushes.fetch_add(1, Ordering::Relaxed);
                debug!("Snapshot flushed");
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Snapshot flush failed, will retry on next trigger");
            }
        }

        if closed {
            break;
        }
    }
}
