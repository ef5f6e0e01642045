//! Progress reporting for harvesting runs.
//!
//! Long-running subtasks report `(current, total)` pairs through
//! [`ProgressCounter`]; everything else flows through [`HarvestProgress`]
//! events delivered to an optional callback.

use std::sync::atomic::{AtomicI64, Ordering};

/// Total value reported while the size of a stream is unknown.
pub const UNKNOWN_TOTAL: i64 = -1;

/// Progress events emitted while harvesting.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HarvestProgress {
    /// Processed item count for a subtask.
    Progress {
        /// Subtask reporting progress.
        subtask: String,
        /// Items processed so far.
        current: i64,
        /// Expected total, or [`UNKNOWN_TOTAL`].
        total: i64,
    },

    /// A failed request was scheduled for another attempt.
    RequestRetry {
        /// URL being retried.
        url: String,
        /// Attempt number about to run (1-indexed retry count).
        attempt: usize,
        /// Maximum retries allowed.
        max_retry: usize,
    },

    /// Raw payloads were written to a raw table.
    RawPersisted {
        /// Raw table written to.
        table: String,
        /// Number of raw rows written.
        count: usize,
    },

    /// A batch of records was flushed to a destination table.
    BatchFlushed {
        /// Destination table.
        table: String,
        /// Rows in the batch.
        count: usize,
    },

    /// A non-fatal problem was skipped.
    Warning {
        /// Human-readable description.
        message: String,
    },
}

/// Callback type for progress reporting.
pub type ProgressCallback = Box<dyn Fn(HarvestProgress) + Send + Sync>;

/// Helper to emit progress if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: HarvestProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}

/// Shared `(current, total)` counter for a single subtask.
#[derive(Debug)]
pub struct ProgressCounter {
    current: AtomicI64,
    total: AtomicI64,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self {
            current: AtomicI64::new(0),
            total: AtomicI64::new(UNKNOWN_TOTAL),
        }
    }
}

impl ProgressCounter {
    /// Overwrite both values.
    pub fn set(&self, current: i64, total: i64) {
        self.current.store(current, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Update the expected total, keeping the current count.
    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Advance the current count and return the new value.
    pub fn inc(&self, delta: i64) -> i64 {
        self.current.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Snapshot of `(current, total)`.
    pub fn get(&self) -> (i64, i64) {
        (
            self.current.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn counter_starts_with_unknown_total() {
        let counter = ProgressCounter::default();
        assert_eq!(counter.get(), (0, UNKNOWN_TOTAL));
    }

    #[test]
    fn counter_increments_and_sets_total() {
        let counter = ProgressCounter::default();
        assert_eq!(counter.inc(2), 2);
        assert_eq!(counter.inc(3), 5);
        counter.set_total(10);
        assert_eq!(counter.get(), (5, 10));
        counter.set(0, UNKNOWN_TOTAL);
        assert_eq!(counter.get(), (0, -1));
    }

    #[test]
    fn emit_forwards_to_callback() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let capture = Arc::clone(&events);
        let cb: ProgressCallback = Box::new(move |event| {
            capture.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        });

        emit(
            Some(&cb),
            HarvestProgress::Warning {
                message: "skipped".into(),
            },
        );
        emit(None, HarvestProgress::Warning { message: "lost".into() });

        let events = events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(
            *events,
            vec![HarvestProgress::Warning {
                message: "skipped".into()
            }]
        );
    }
}
