//! Fire-and-forget reporting of finished queries to a time-series database.
//!
//! Each finished query produces one `query-finished` point. Points are handed
//! to a background thread over a bounded channel and posted to an
//! InfluxDB-compatible `/write` endpoint in line protocol. Nothing waits for
//! the sink: a full channel or an unreachable sink only costs a log line.

use crate::config::TelemetryConfig;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Points queued beyond this are dropped.
const QUEUE_CAPACITY: usize = 1024;

/// Measurement name of finished-query points.
pub const QUERY_FINISHED: &str = "query-finished";

/// One finished query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFinished {
    pub query_id: String,
    pub searchterm: String,
    pub milliseconds: u64,
    pub results: u64,
}

impl QueryFinished {
    /// Render as one line of InfluxDB line protocol.
    pub fn line_protocol(&self) -> String {
        format!(
            "{},queryid={} searchterm=\"{}\",milliseconds={}i,results={}i",
            QUERY_FINISHED,
            escape_tag(&self.query_id),
            escape_field(&self.searchterm),
            self.milliseconds,
            self.results
        )
    }
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Handle for submitting points. Cloning shares the same background thread.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    sender: Option<Sender<QueryFinished>>,
}

impl Telemetry {
    /// Telemetry that drops everything.
    pub fn disabled() -> Self {
        Telemetry { sender: None }
    }

    /// Start the sink thread if a host is configured.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        let Some(host) = config.host.as_deref().filter(|h| !h.trim().is_empty()) else {
            debug!("No telemetry host configured");
            return Self::disabled();
        };

        let endpoint = match write_endpoint(host, config) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(host, error = %e, "Invalid telemetry host, telemetry disabled");
                return Self::disabled();
            }
        };

        let (telemetry, receiver) = Self::channel();
        let spawned = thread::Builder::new()
            .name("sift-telemetry".to_string())
            .spawn(move || post_loop(endpoint, receiver));
        match spawned {
            Ok(_) => telemetry,
            Err(e) => {
                warn!(error = %e, "Could not start telemetry thread, telemetry disabled");
                Self::disabled()
            }
        }
    }

    /// Telemetry feeding a channel the caller drains itself.
    pub fn channel() -> (Self, Receiver<QueryFinished>) {
        let (sender, receiver) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        (
            Telemetry {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a point without blocking.
    pub fn record(&self, point: QueryFinished) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(point) {
            Ok(()) => {}
            Err(TrySendError::Full(point)) => {
                warn!(query_id = %point.query_id, "Telemetry queue full, dropping point");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Telemetry sink gone, dropping point");
            }
        }
    }
}

fn write_endpoint(host: &str, config: &TelemetryConfig) -> Result<url::Url, url::ParseError> {
    let mut endpoint = url::Url::parse(&format!("http://{}/write", host))?;
    endpoint
        .query_pairs_mut()
        .append_pair("db", &config.database)
        .append_pair("u", &config.username)
        .append_pair("p", &config.password);
    Ok(endpoint)
}

fn post_loop(endpoint: url::Url, receiver: Receiver<QueryFinished>) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Could not build telemetry client");
            return;
        }
    };

    for point in receiver {
        let result = client
            .post(endpoint.clone())
            .body(point.line_protocol())
            .send()
            .and_then(|response| response.error_for_status());
        match result {
            Ok(_) => debug!(query_id = %point.query_id, "Posted query telemetry"),
            Err(e) => warn!(query_id = %point.query_id, error = %e, "Could not post query telemetry"),
        }
    }
}
