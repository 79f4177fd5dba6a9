//! Per-query event log and subscriber notification.
//!
//! Every query owns an [`EventBus`]: an append-only log of [`Event`]s and a
//! condition variable shared by all readers of that query. Readers hold a
//! [`Subscription`], which is just a cursor into the log, and block until
//! something new is appended.
//!
//! ## Coalescing
//!
//! Some event kinds describe a state rather than an occurrence. For those, a
//! newer event obsoletes an older one a reader has not received yet, so a slow
//! reader gets only the latest value instead of the whole backlog. Results and
//! errors are never coalesced.
//!
//! The log ends with [`Event::Done`]; nothing is appended after it.

use crate::types::ResultRecord;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Aggregate progress of a query across all backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProgressUpdate {
    pub query_id: String,
    pub files_processed: u64,
    pub files_total: u64,
    pub results: usize,
}

/// Final page count, available once results are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pagination {
    pub query_id: String,
    pub result_pages: usize,
}

/// The kind of error reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// One backend could not be queried; the query continues without it
    BackendUnavailable,

    /// Persisting the results failed; terminal
    Failed,

    /// A client cancelled the query; terminal
    Cancelled,
}

/// Error notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    #[serde(rename = "ErrorType")]
    pub kind: ErrorKind,
}

/// A notification about a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum Event {
    /// A result entered the live top ten
    Result(ResultRecord),

    /// Aggregate progress
    Progress(ProgressUpdate),

    /// Results were persisted into pages
    Pagination(Pagination),

    /// Something went wrong, or the query was cancelled
    Error(ErrorEvent),

    /// End of the event stream. Carries no payload.
    #[serde(skip_serializing)]
    Done,
}

/// Discriminant of [`Event`], for coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Result,
    Progress,
    Pagination,
    Error,
    Done,
}

impl EventKind {
    /// Whether a newer event of this kind replaces an undelivered older one.
    pub fn coalesces(self) -> bool {
        matches!(self, EventKind::Progress | EventKind::Pagination)
    }
}

impl Event {
    pub fn error(kind: ErrorKind) -> Self {
        Event::Error(ErrorEvent { kind })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Result(_) => EventKind::Result,
            Event::Progress(_) => EventKind::Progress,
            Event::Pagination(_) => EventKind::Pagination,
            Event::Error(_) => EventKind::Error,
            Event::Done => EventKind::Done,
        }
    }

    /// Whether this event makes `earlier` pointless to deliver.
    pub fn obsoletes(&self, earlier: &Event) -> bool {
        let kind = self.kind();
        kind.coalesces() && kind == earlier.kind()
    }

    /// Whether this is a terminal event for clients (done, failed or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Done
                | Event::Error(ErrorEvent {
                    kind: ErrorKind::Failed | ErrorKind::Cancelled
                })
        )
    }

    /// JSON payload sent to clients. [`Event::Done`] has an empty payload.
    pub fn payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Event::Done => Ok(Vec::new()),
            other => serde_json::to_vec(other),
        }
    }
}

/// Drop every event that a later event in `pending` obsoletes.
fn coalesce(pending: &[Arc<Event>]) -> Vec<Arc<Event>> {
    let mut seen: HashSet<EventKind> = HashSet::new();
    let mut kept: Vec<Arc<Event>> = Vec::with_capacity(pending.len());
    for event in pending.iter().rev() {
        let kind = event.kind();
        if kind.coalesces() && !seen.insert(kind) {
            continue;
        }
        kept.push(event.clone());
    }
    kept.reverse();
    kept
}

/// Append-only event log of one query.
#[derive(Debug, Default)]
pub struct EventBus {
    log: Mutex<Vec<Arc<Event>>>,
    appended: Condvar,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and wake every waiting reader.
    ///
    /// Returns false if the log was already closed by [`Event::Done`].
    pub fn add_event(&self, event: Event) -> bool {
        let mut log = self.log.lock();
        if matches!(log.last().map(|e| e.as_ref()), Some(Event::Done)) {
            debug!(kind = ?event.kind(), "Dropping event appended after end of stream");
            return false;
        }
        log.push(Arc::new(event));
        drop(log);
        self.appended.notify_all();
        true
    }

    /// Append the end-of-stream marker.
    pub fn close(&self) -> bool {
        self.add_event(Event::Done)
    }

    /// Number of events in the log
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.log.lock().last().map(|e| e.as_ref()), Some(Event::Done))
    }

    /// Start reading the log from its beginning.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        Subscription {
            bus: self.clone(),
            cursor: 0,
            finished: false,
        }
    }
}

/// A reader's position in an [`EventBus`].
#[derive(Debug)]
pub struct Subscription {
    bus: Arc<EventBus>,
    cursor: usize,
    finished: bool,
}

impl Subscription {
    /// Take all undelivered events, coalesced, without blocking.
    pub fn try_next_batch(&mut self) -> Vec<Arc<Event>> {
        let bus = self.bus.clone();
        let log = bus.log.lock();
        self.take_pending(&log)
    }

    /// Wait up to `timeout` for undelivered events and take them, coalesced.
    ///
    /// Returns an empty batch on timeout or once the end marker has been
    /// delivered.
    pub fn next_batch(&mut self, timeout: Duration) -> Vec<Arc<Event>> {
        if self.finished {
            return Vec::new();
        }
        let deadline = Instant::now() + timeout;
        let bus = self.bus.clone();
        let mut log = bus.log.lock();
        while log.len() <= self.cursor {
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            bus.appended.wait_for(&mut log, deadline - now);
        }
        self.take_pending(&log)
    }

    /// Whether the end-of-stream marker has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_pending(&mut self, log: &[Arc<Event>]) -> Vec<Arc<Event>> {
        if self.cursor >= log.len() {
            return Vec::new();
        }
        let batch = coalesce(&log[self.cursor..]);
        self.cursor = log.len();
        if matches!(batch.last().map(|e| e.as_ref()), Some(Event::Done)) {
            self.finished = true;
        }
        batch
    }
}
