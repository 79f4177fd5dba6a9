//! Streaming connection to one index backend.
//!
//! A [`BackendClient`] sends the query once, then decodes the backend's reply
//! as a stream of concatenated JSON records until the backend closes the
//! connection, goes quiet for longer than the read timeout, or sends something
//! undecodable. Whatever the reason, the client finally tells the query state
//! that this backend is finished, so a dead backend can never keep a query
//! from completing.

use crate::query::QueryState;
use crate::types::{BackendId, BackendRecord, WireRecord};
use std::io::{self, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for one backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    backend: BackendId,
    address: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl BackendClient {
    pub fn new(
        backend: BackendId,
        address: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        BackendClient {
            backend,
            address: address.into(),
            connect_timeout,
            read_timeout,
        }
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Run the client on its own thread.
    pub fn spawn(self, state: Arc<QueryState>, payload: Arc<[u8]>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("backend-{}", self.backend))
            .spawn(move || self.run(&state, &payload))
    }

    /// Query the backend and feed everything it sends into `state`.
    pub fn run(&self, state: &QueryState, payload: &[u8]) {
        match self.stream(state, payload) {
            Ok(records) => {
                debug!(
                    query_id = %state.id(),
                    backend = %self.backend,
                    records,
                    "Backend stream ended"
                );
            }
            Err(e) if is_timeout(&e) => {
                info!(
                    query_id = %state.id(),
                    backend = %self.backend,
                    address = %self.address,
                    "Backend timed out"
                );
            }
            Err(e) => {
                warn!(
                    query_id = %state.id(),
                    backend = %self.backend,
                    address = %self.address,
                    error = %e,
                    "Backend query failed"
                );
            }
        }
        state.backend_finished(self.backend);
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", self.address),
            )
        }))
    }

    /// Returns the number of records consumed.
    fn stream(&self, state: &QueryState, payload: &[u8]) -> io::Result<usize> {
        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;
        stream.write_all(payload)?;
        debug!(query_id = %state.id(), backend = %self.backend, "Query sent");

        let records =
            serde_json::Deserializer::from_reader(BufReader::new(stream)).into_iter::<WireRecord>();

        let mut count = 0;
        for record in records {
            if state.is_done() {
                debug!(query_id = %state.id(), backend = %self.backend, "Query done, hanging up");
                break;
            }
            match BackendRecord::from(record?) {
                BackendRecord::Result(hit) => state.store_result(self.backend, hit),
                BackendRecord::Progress {
                    files_processed,
                    files_total,
                } => state.store_progress(self.backend, files_processed, files_total),
                BackendRecord::Unknown(kind) => {
                    debug!(backend = %self.backend, kind, "Ignoring unknown record type");
                }
            }
            count += 1;
        }
        Ok(count)
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
