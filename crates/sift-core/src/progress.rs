//! Per-backend progress accounting and global completion detection.
//!
//! Each backend reports how many of its files it has processed and, at some
//! point, how many it holds in total. A query is complete exactly when every
//! backend has reported a total at least once and the processed counters sum
//! up to the totals.

use crate::types::BackendId;
use serde::Serialize;

/// Aggregate progress across all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Whether every backend has reported its total
    pub all_totals_known: bool,

    /// Sum of processed counters
    pub files_processed: u64,

    /// Sum of known totals
    pub files_total: u64,
}

impl ProgressSnapshot {
    /// True once all totals are known and everything has been processed.
    pub fn is_complete(&self) -> bool {
        self.all_totals_known && self.files_processed == self.files_total
    }
}

/// Progress counters of one backend, for introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendProgress {
    pub files_processed: u64,
    pub files_total: Option<u64>,
}

/// Tracks processed/total counters for every backend of a query.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    backends: Vec<BackendProgress>,
}

impl ProgressTracker {
    pub fn new(backends: usize) -> Self {
        ProgressTracker {
            backends: vec![
                BackendProgress {
                    files_processed: 0,
                    files_total: None,
                };
                backends
            ],
        }
    }

    /// Record a progress report and return the resulting aggregate.
    ///
    /// A report without a total keeps the previously reported one. Reports for
    /// unknown backends are ignored.
    pub fn update(
        &mut self,
        backend: BackendId,
        files_processed: u64,
        files_total: Option<u64>,
    ) -> ProgressSnapshot {
        if let Some(entry) = self.backends.get_mut(backend.index()) {
            entry.files_processed = files_processed;
            if files_total.is_some() {
                entry.files_total = files_total;
            }
        }
        self.snapshot()
    }

    /// Current aggregate
    pub fn snapshot(&self) -> ProgressSnapshot {
        let all_totals_known = self.backends.iter().all(|b| b.files_total.is_some());
        ProgressSnapshot {
            all_totals_known,
            files_processed: self.backends.iter().map(|b| b.files_processed).sum(),
            files_total: self.backends.iter().filter_map(|b| b.files_total).sum(),
        }
    }

    /// Whether this backend has reported all of its files as processed.
    pub fn has_completed(&self, backend: BackendId) -> bool {
        self.backends
            .get(backend.index())
            .map(|b| b.files_total == Some(b.files_processed))
            .unwrap_or(true)
    }

    /// The backend's reported total, or 0 if it never reported one.
    pub fn best_known_total(&self, backend: BackendId) -> u64 {
        self.backends
            .get(backend.index())
            .and_then(|b| b.files_total)
            .unwrap_or(0)
    }

    /// Counters of every backend, in backend order
    pub fn per_backend(&self) -> &[BackendProgress] {
        &self.backends
    }
}
