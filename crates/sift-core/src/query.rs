//! State of one running or finished query.
//!
//! Backend workers feed results and progress into a [`QueryState`] from their
//! own threads. All mutable state sits behind a single lock and every mutation
//! is one critical section: ranking, buffer update, spool append and counters
//! happen together, so concurrent workers can never observe each other half
//! way. Events are published after the lock is released.
//!
//! ## Lifecycle
//!
//! ```text
//! Running --(all progress in)--> Persisting --(pages written)--> Done
//!    |                               |
//!    +------(cancel / failure)-------+-----------------------> Done
//! ```
//!
//! `Done` is reached exactly once. Afterwards every late write from a worker
//! is ignored, the spool files are closed, and the event stream is ended.

use crate::error::{Result, SiftError};
use crate::events::{ErrorKind, Event, EventBus, Pagination, ProgressUpdate, Subscription};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::ranking::TopKMerger;
use crate::reclaim::SpaceReclaimer;
use crate::rewrite::BackendRequest;
use crate::spool::{ResultSpool, SpoolSnapshot};
use crate::telemetry::{QueryFinished, Telemetry};
use crate::types::{BackendId, Match, ResultRecord, PACKAGES_PER_PAGE};
use crate::writer::{read_package_page, DiskWriter};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Collaborators shared by every query of a registry.
#[derive(Debug)]
pub(crate) struct Services {
    pub reclaimer: Arc<SpaceReclaimer>,
    pub telemetry: Telemetry,
    pub failed_queries: AtomicU64,
}

impl Services {
    pub fn new(reclaimer: Arc<SpaceReclaimer>, telemetry: Telemetry) -> Self {
        Services {
            reclaimer,
            telemetry,
            failed_queries: AtomicU64::new(0),
        }
    }

    pub fn record_failure(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Where a query is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Backends are streaming
    Running,

    /// Every backend is complete, result files are being written
    Persisting,

    /// Terminal
    Done,
}

struct QueryInner {
    merger: TopKMerger,
    spool: ResultSpool,
    progress: ProgressTracker,
    phase: Phase,
    failed: bool,
    cancelled: bool,
    result_pages: usize,
    packages: Vec<String>,
}

/// Introspection snapshot of one query
#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub query_id: String,
    pub searchterm: String,
    pub phase: Phase,
    pub done: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub num_events: usize,
    pub num_results: usize,
    pub num_result_pages: usize,
    pub num_packages: usize,
    pub files_processed: Vec<u64>,
    pub files_total: Vec<Option<u64>>,
}

/// One query fanned out to every backend.
pub struct QueryState {
    id: String,
    searchterm: String,
    started: Instant,
    started_at: DateTime<Utc>,
    dir: PathBuf,
    events: Arc<EventBus>,
    inner: Mutex<QueryInner>,
    completed: Condvar,
    services: Arc<Services>,
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("id", &self.id)
            .field("searchterm", &self.searchterm)
            .field("dir", &self.dir)
            .field("phase", &self.inner.try_lock().map(|inner| inner.phase))
            .finish()
    }
}

impl QueryState {
    /// Create the state and the spool files of a new query in `dir`.
    pub(crate) fn new(
        id: impl Into<String>,
        request: &BackendRequest,
        dir: impl AsRef<Path>,
        backends: usize,
        services: Arc<Services>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let spool = ResultSpool::create(&dir, backends)?;

        Ok(QueryState {
            id: id.into(),
            searchterm: request.query.clone(),
            started: Instant::now(),
            started_at: Utc::now(),
            dir,
            events: Arc::new(EventBus::new()),
            inner: Mutex::new(QueryInner {
                merger: TopKMerger::new(),
                spool,
                progress: ProgressTracker::new(backends),
                phase: Phase::Running,
                failed: false,
                cancelled: false,
                result_pages: 0,
                packages: Vec::new(),
            }),
            completed: Condvar::new(),
            services,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn searchterm(&self) -> &str {
        &self.searchterm
    }

    /// Directory holding this query's files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Time since the query was started
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn is_done(&self) -> bool {
        self.phase() == Phase::Done
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed
    }

    /// Read this query's events from the start.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// The live best-of buffer, best first.
    pub fn best(&self) -> Vec<ResultRecord> {
        self.inner.lock().merger.best().to_vec()
    }

    /// Number of `page_<n>.json` files, once persisted.
    pub fn result_pages(&self) -> usize {
        self.inner.lock().result_pages
    }

    /// Sorted packages with results, once persisted.
    pub fn packages(&self) -> Vec<String> {
        self.inner.lock().packages.clone()
    }

    /// Rank, buffer and spool one result from `backend`.
    pub fn store_result(&self, backend: BackendId, hit: Match) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Running {
            return;
        }

        let ranking = inner.merger.rank(hit.path_rank, hit.ranking);
        let mut record = ResultRecord::new(hit);
        record.hit.ranking = ranking;

        let entered = inner.merger.offer(&record);
        if let Err(e) = inner.spool.record(backend, &record) {
            drop(inner);
            error!(query_id = %self.id, backend = %backend, error = %e, "Could not spool result");
            self.fail();
            return;
        }
        drop(inner);

        if entered {
            self.events.add_event(Event::Result(record));
        }
    }

    /// Record a progress report from `backend`, persisting the results once
    /// every backend is complete.
    pub fn store_progress(&self, backend: BackendId, files_processed: u64, files_total: Option<u64>) {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Running {
            return;
        }

        let snapshot = inner.progress.update(backend, files_processed, files_total);
        if !snapshot.all_totals_known {
            debug!(
                query_id = %self.id,
                backend = %backend,
                files_processed,
                "Progress before all totals are known"
            );
            return;
        }

        let results = inner.spool.num_results();
        if !snapshot.is_complete() {
            drop(inner);
            self.events
                .add_event(Event::Progress(self.progress_update(snapshot, results)));
            return;
        }

        inner.phase = Phase::Persisting;
        let drained = inner.spool.drain();
        drop(inner);

        info!(
            query_id = %self.id,
            results,
            files = snapshot.files_total,
            "All backends complete"
        );
        self.persist(drained, snapshot, results);
    }

    /// A worker stopped talking to `backend`, for whatever reason.
    ///
    /// If the backend had not reported completion, clients are told it was
    /// unavailable and its progress is completed with what it reported so far.
    pub fn backend_finished(&self, backend: BackendId) {
        let inner = self.inner.lock();
        if inner.phase != Phase::Running || inner.progress.has_completed(backend) {
            return;
        }
        let total = inner.progress.best_known_total(backend);
        drop(inner);

        warn!(query_id = %self.id, backend = %backend, "Backend unavailable");
        self.events
            .add_event(Event::error(ErrorKind::BackendUnavailable));
        self.store_progress(backend, total, Some(total));
    }

    /// Stop the query on behalf of a client. Returns false if it had already
    /// ended.
    pub fn cancel(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Done || inner.cancelled || inner.failed {
                return false;
            }
            inner.cancelled = true;
        }
        info!(query_id = %self.id, "Query cancelled");
        self.events.add_event(Event::error(ErrorKind::Cancelled));
        self.finish()
    }

    /// End the query as failed.
    pub(crate) fn fail(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Done || inner.cancelled || inner.failed {
                return;
            }
            inner.failed = true;
        }
        self.services.record_failure();
        error!(query_id = %self.id, "Query failed");
        self.events.add_event(Event::error(ErrorKind::Failed));
        self.finish();
    }

    /// Move to the terminal state. Returns false if already there.
    pub(crate) fn finish(&self) -> bool {
        let results = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Done {
                return false;
            }
            inner.phase = Phase::Done;
            inner.spool.close();
            inner.spool.num_results()
        };
        self.completed.notify_all();
        self.events.close();
        self.services.reclaimer.release(&self.id);

        let elapsed = self.started.elapsed();
        info!(
            query_id = %self.id,
            results,
            elapsed_ms = elapsed.as_millis() as u64,
            "Query finished"
        );
        self.services.telemetry.record(QueryFinished {
            query_id: self.id.clone(),
            searchterm: self.searchterm.clone(),
            milliseconds: elapsed.as_millis() as u64,
            results: results as u64,
        });
        true
    }

    /// Block until the query is done or `timeout` passes. Returns whether it
    /// is done.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.phase != Phase::Done {
            if self
                .completed
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.phase == Phase::Done;
            }
        }
        true
    }

    /// One page of per-package results of a finished query.
    pub fn package_page(&self, page: usize) -> Result<String> {
        let packages = {
            let inner = self.inner.lock();
            if inner.phase != Phase::Done {
                return Err(SiftError::QueryNotFinished {
                    id: self.id.clone(),
                });
            }
            if inner.failed {
                return Err(SiftError::QueryFailed {
                    id: self.id.clone(),
                });
            }
            let pages = inner.packages.len().div_ceil(PACKAGES_PER_PAGE);
            if page >= pages {
                return Err(SiftError::PageNotFound { page, pages });
            }
            let start = page * PACKAGES_PER_PAGE;
            let end = (start + PACKAGES_PER_PAGE).min(inner.packages.len());
            inner.packages[start..end].to_vec()
        };
        read_package_page(&self.dir, &packages)
    }

    pub fn stats(&self) -> QueryStats {
        let inner = self.inner.lock();
        let per_backend = inner.progress.per_backend();
        QueryStats {
            query_id: self.id.clone(),
            searchterm: self.searchterm.clone(),
            phase: inner.phase,
            done: inner.phase == Phase::Done,
            failed: inner.failed,
            cancelled: inner.cancelled,
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            num_events: self.events.len(),
            num_results: inner.spool.num_results(),
            num_result_pages: inner.result_pages,
            num_packages: inner.spool.num_packages(),
            files_processed: per_backend.iter().map(|b| b.files_processed).collect(),
            files_total: per_backend.iter().map(|b| b.files_total).collect(),
        }
    }

    fn progress_update(&self, snapshot: ProgressSnapshot, results: usize) -> ProgressUpdate {
        ProgressUpdate {
            query_id: self.id.clone(),
            files_processed: snapshot.files_processed,
            files_total: snapshot.files_total,
            results,
        }
    }

    fn persist(&self, drained: Result<SpoolSnapshot>, snapshot: ProgressSnapshot, results: usize) {
        let writer = DiskWriter::new(&self.dir, self.services.reclaimer.clone());
        let persisted = match drained.and_then(|spool| writer.persist(spool)) {
            Ok(persisted) => persisted,
            Err(e) => {
                error!(query_id = %self.id, error = %e, "Could not persist results");
                self.fail();
                return;
            }
        };

        let result_pages = persisted.result_pages;
        {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Persisting {
                debug!(query_id = %self.id, "Query ended while persisting");
                return;
            }
            inner.result_pages = result_pages;
            inner.packages = persisted.packages;
        }

        if result_pages > 0 {
            self.events.add_event(Event::Pagination(Pagination {
                query_id: self.id.clone(),
                result_pages,
            }));
        }
        self.events
            .add_event(Event::Progress(self.progress_update(snapshot, results)));
        self.finish();
    }
}
