//! Registry of running and finished queries.
//!
//! The registry maps query identifiers to their [`QueryState`]. Starting a
//! query that is already registered and fresh attaches to the existing run;
//! otherwise a new run is created and one [`BackendClient`] thread is spawned
//! per configured backend.
//!
//! Finished queries stay registered so late readers can still fetch their
//! results. Once the registry holds `max_live_queries` entries, finished ones
//! are dropped to make room. Running queries are never dropped, so the limit
//! is soft.

use crate::client::BackendClient;
use crate::config::Config;
use crate::error::{Result, SiftError};
use crate::events::Subscription;
use crate::query::{QueryState, QueryStats, Services};
use crate::reclaim::SpaceReclaimer;
use crate::rewrite::{BackendRequest, DefaultRewriter, QueryRewriter};
use crate::telemetry::Telemetry;
use crate::types::BackendId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Whether [`QueryRegistry::start_or_attach`] started a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Attached,
}

/// Registry tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub results_dir: PathBuf,
    pub backends: Vec<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_live_queries: usize,
    pub stale_after: Duration,
    pub completion_wait: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        RegistrySettings {
            results_dir: config.general.results_dir.clone(),
            backends: config.backends.addresses.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_live_queries: config.registry.max_live_queries,
            stale_after: config.stale_after(),
            completion_wait: config.completion_wait(),
        }
    }
}

/// Introspection snapshot of the whole registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub queries: Vec<QueryStats>,
    pub failed_queries: u64,
}

/// All queries known to this process.
pub struct QueryRegistry {
    settings: RegistrySettings,
    rewriter: Arc<dyn QueryRewriter>,
    services: Arc<Services>,
    queries: Mutex<HashMap<String, Arc<QueryState>>>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("settings", &self.settings)
            .field("queries", &self.len())
            .finish()
    }
}

impl QueryRegistry {
    /// Build a registry with the default rewriter and the configured
    /// reclaimer and telemetry sink.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let settings = RegistrySettings::from_config(config);
        let reclaimer = SpaceReclaimer::new(&settings.results_dir, config.storage.headroom_bytes);
        Ok(Self::new(
            settings,
            Arc::new(DefaultRewriter),
            Arc::new(reclaimer),
            Telemetry::from_config(&config.telemetry),
        ))
    }

    pub fn new(
        settings: RegistrySettings,
        rewriter: Arc<dyn QueryRewriter>,
        reclaimer: Arc<SpaceReclaimer>,
        telemetry: Telemetry,
    ) -> Self {
        QueryRegistry {
            settings,
            rewriter,
            services: Arc::new(Services::new(reclaimer, telemetry)),
            queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Start the query `id`, or attach to its current run.
    ///
    /// A registered run older than `stale_after` is ended and replaced.
    #[instrument(skip(self, raw_query))]
    pub fn start_or_attach(&self, id: &str, raw_query: &str) -> Result<StartOutcome> {
        validate_query_id(id)?;

        let request = self.rewriter.rewrite(raw_query)?;
        let payload: Arc<[u8]> = request.to_payload()?.into();

        let mut queries = self.queries.lock();
        if let Some(existing) = queries.get(id) {
            if existing.age() < self.settings.stale_after {
                debug!(query_id = %id, "Attaching to running query");
                return Ok(StartOutcome::Attached);
            }
            info!(query_id = %id, age_secs = existing.age().as_secs(), "Replacing stale query");
            existing.finish();
            queries.remove(id);
        }

        if queries.len() >= self.settings.max_live_queries {
            collect_garbage(&mut queries, self.settings.max_live_queries);
        }

        let dir = self.settings.results_dir.join(id);
        let reclaimer = &self.services.reclaimer;
        reclaimer.mark_in_use(id);
        let state = match self.create_state(id, &request, &dir) {
            Ok(state) => Arc::new(state),
            Err(e) => {
                reclaimer.release(id);
                self.services.record_failure();
                warn!(query_id = %id, error = %e, "Could not start query");
                return Err(e);
            }
        };
        queries.insert(id.to_string(), state.clone());
        drop(queries);

        info!(
            query_id = %id,
            searchterm = %request.query,
            backends = self.settings.backends.len(),
            "Starting query"
        );
        for (idx, address) in self.settings.backends.iter().enumerate() {
            let backend = BackendId::new(idx);
            let client = BackendClient::new(
                backend,
                address.clone(),
                self.settings.connect_timeout,
                self.settings.read_timeout,
            );
            if let Err(e) = client.spawn(state.clone(), payload.clone()) {
                warn!(query_id = %id, backend = %backend, error = %e, "Could not spawn backend worker");
                state.backend_finished(backend);
            }
        }

        Ok(StartOutcome::Started)
    }

    fn create_state(&self, id: &str, request: &BackendRequest, dir: &Path) -> Result<QueryState> {
        self.services.reclaimer.ensure_headroom()?;
        remove_previous_run(dir)?;
        fs::create_dir_all(dir)?;
        QueryState::new(
            id,
            request,
            dir,
            self.settings.backends.len(),
            self.services.clone(),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<QueryState>> {
        self.queries.lock().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<QueryState>> {
        self.get(id).ok_or_else(|| SiftError::QueryNotFound { id: id.to_string() })
    }

    /// Cancel a query. Returns false if it had already ended.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        Ok(self.require(id)?.cancel())
    }

    /// Read a query's events from the start.
    pub fn subscribe(&self, id: &str) -> Result<Subscription> {
        Ok(self.require(id)?.subscribe())
    }

    /// One page of per-package results, waiting for the query to finish
    /// first.
    #[instrument(skip(self))]
    pub fn package_page(&self, id: &str, page: usize) -> Result<String> {
        let state = self.require(id)?;
        if !state.wait_done(self.settings.completion_wait) {
            return Err(SiftError::QueryNotFinished { id: id.to_string() });
        }
        state.package_page(page)
    }

    /// Stats of every registered query, by id.
    pub fn introspect(&self) -> RegistryStats {
        let states: Vec<Arc<QueryState>> = self.queries.lock().values().cloned().collect();
        let mut queries: Vec<QueryStats> = states.iter().map(|s| s.stats()).collect();
        queries.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        RegistryStats {
            queries,
            failed_queries: self.failed_queries(),
        }
    }

    /// Number of queries that ended in failure
    pub fn failed_queries(&self) -> u64 {
        self.services.failed_queries.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.lock().is_empty()
    }
}

/// Query ids name directories, so they must be a single path component.
fn validate_query_id(id: &str) -> Result<()> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if invalid {
        return Err(SiftError::InvalidQueryId { id: id.to_string() });
    }
    Ok(())
}

/// Drop finished queries, oldest first, until fewer than `max` remain.
fn collect_garbage(queries: &mut HashMap<String, Arc<QueryState>>, max: usize) {
    let mut done: Vec<(Duration, String)> = queries
        .iter()
        .filter(|(_, state)| state.is_done())
        .map(|(id, state)| (state.age(), id.clone()))
        .collect();
    done.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, id) in done {
        if queries.len() < max {
            break;
        }
        debug!(query_id = %id, "Forgetting finished query");
        queries.remove(&id);
    }
    if queries.len() >= max {
        debug!(live = queries.len(), max, "Query limit exceeded by running queries");
    }
}

/// Clear files a previous run of the same id left behind.
fn remove_previous_run(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed previous results");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorKind, Event};
    use crate::reclaim::SpaceProbe;
    use crate::telemetry::QueryFinished;
    use crossbeam_channel::Receiver;
    use serde_json::{json, Value};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};
    use tempfile::TempDir;

    struct Plenty;

    impl SpaceProbe for Plenty {
        fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    /// Serves one connection: returns the request line, then streams
    /// `records` and hangs up after `linger`.
    fn fake_backend(records: Vec<Value>, linger: Duration) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = String::new();
            BufReader::new(stream.try_clone().unwrap())
                .read_line(&mut request)
                .unwrap();
            for record in records {
                stream.write_all(record.to_string().as_bytes()).unwrap();
                stream.write_all(b"\n").unwrap();
            }
            thread::sleep(linger);
            request
        });
        (address, handle)
    }

    fn dead_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn progress(processed: u64, total: u64) -> Value {
        json!({"Type": "progress", "FilesProcessed": processed, "FilesTotal": total})
    }

    fn hit(path: &str, path_rank: f32, ranking: f32) -> Value {
        json!({"Path": path, "Line": 3, "Context": "foo();", "PathRank": path_rank, "Ranking": ranking})
    }

    fn new_registry(
        temp_dir: &TempDir,
        backends: Vec<String>,
    ) -> (QueryRegistry, Receiver<QueryFinished>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let settings = RegistrySettings {
            results_dir: temp_dir.path().join("qr"),
            backends,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(500),
            max_live_queries: 10,
            stale_after: Duration::from_secs(1800),
            completion_wait: Duration::from_secs(10),
        };
        let reclaimer = SpaceReclaimer::new(&settings.results_dir, 1024).with_probe(Arc::new(Plenty));
        let (telemetry, receiver) = Telemetry::channel();
        let registry = QueryRegistry::new(
            settings,
            Arc::new(DefaultRewriter),
            Arc::new(reclaimer),
            telemetry,
        );
        (registry, receiver)
    }

    fn wait(registry: &QueryRegistry, id: &str) -> Arc<QueryState> {
        let state = registry.get(id).unwrap();
        assert!(state.wait_done(Duration::from_secs(10)));
        state
    }

    fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while !sub.is_finished() {
            let batch = sub.next_batch(Duration::from_secs(10));
            assert!(!batch.is_empty(), "event stream stalled");
            events.extend(batch);
        }
        events
    }

    #[test]
    fn test_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let (a, a_handle) = fake_backend(
            vec![hit("pkgX_1.0/a.c", 0.8, 0.5), progress(1, 1)],
            Duration::ZERO,
        );
        let (b, b_handle) = fake_backend(
            vec![hit("pkgX_1.0/b.c", 0.8, 0.9), progress(1, 1)],
            Duration::ZERO,
        );
        let (registry, telemetry) = new_registry(&temp_dir, vec![a, b]);

        assert_eq!(
            registry.start_or_attach("q1", "q=foo").unwrap(),
            StartOutcome::Started
        );
        let state = wait(&registry, "q1");
        assert!(!state.is_failed());

        let request: Value = serde_json::from_str(&a_handle.join().unwrap()).unwrap();
        assert_eq!(request, json!({"Query": "foo", "URL": "?q=foo"}));
        b_handle.join().unwrap();

        let dir = temp_dir.path().join("qr").join("q1");
        let packages: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("packages.json")).unwrap()).unwrap();
        assert_eq!(packages, json!({"Packages": ["pkgX"]}));

        let page: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("page_0.json")).unwrap()).unwrap();
        let page = page.as_array().unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0]["Ranking"].as_f64().unwrap() > page[1]["Ranking"].as_f64().unwrap());
        assert_eq!(page[0]["Package"], "pkgX");
        assert_eq!(page[0]["Context"], "foo();");
        assert!(dir.join("pkg_pkgX.json").exists());
        assert!(dir.join("unsorted_0.json").exists());
        assert!(dir.join("unsorted_1.json").exists());

        let finished = telemetry.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(finished.query_id, "q1");
        assert_eq!(finished.searchterm, "foo");
        assert_eq!(finished.results, 2);

        let response: Value = serde_json::from_str(&registry.package_page("q1", 0).unwrap()).unwrap();
        assert_eq!(response[0]["Package"], "pkgX");
        assert_eq!(response[0]["Results"].as_array().unwrap().len(), 2);
        assert!(matches!(
            registry.package_page("q1", 1),
            Err(SiftError::PageNotFound { page: 1, pages: 1 })
        ));
    }

    #[test]
    fn test_dead_backend() {
        let temp_dir = TempDir::new().unwrap();
        let (live, _handle) = fake_backend(
            vec![hit("a_1/x.c", 0.5, 0.5), progress(4, 4)],
            Duration::ZERO,
        );
        let (registry, _telemetry) = new_registry(&temp_dir, vec![live, dead_backend()]);
        registry.start_or_attach("q", "q=x").unwrap();
        let mut sub = registry.subscribe("q").unwrap();

        let state = wait(&registry, "q");
        assert!(!state.is_failed());
        assert_eq!(state.result_pages(), 1);

        let events = drain(&mut sub);
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            Event::Error(err) if err.kind == ErrorKind::BackendUnavailable
        )));
        assert!(matches!(events.last().map(|e| e.as_ref()), Some(Event::Done)));
    }

    #[test]
    fn test_stalled_backend_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let (stalled, _handle) = fake_backend(vec![progress(1, 10)], Duration::from_secs(3));
        let (registry, _telemetry) = new_registry(&temp_dir, vec![stalled]);
        registry.start_or_attach("q", "q=x").unwrap();

        let state = wait(&registry, "q");
        assert!(!state.is_failed());
        assert_eq!(state.stats().files_processed, vec![10]);
    }

    #[test]
    fn test_silent_backend_next_to_empty_one() {
        let temp_dir = TempDir::new().unwrap();
        let (silent, _silent_handle) = fake_backend(vec![], Duration::from_secs(3));
        let (empty, _empty_handle) = fake_backend(vec![progress(0, 0)], Duration::ZERO);
        let (registry, _telemetry) = new_registry(&temp_dir, vec![silent, empty]);
        registry.start_or_attach("q", "q=x").unwrap();
        let mut sub = registry.subscribe("q").unwrap();

        let state = wait(&registry, "q");
        assert!(!state.is_failed());
        assert_eq!(state.result_pages(), 0);

        let events = drain(&mut sub);
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            Event::Error(err) if err.kind == ErrorKind::BackendUnavailable
        )));
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            Event::Progress(p) if p.files_processed == 0 && p.files_total == 0
        )));
        assert!(matches!(events.last().map(|e| e.as_ref()), Some(Event::Done)));
    }

    #[test]
    fn test_malformed_retry_keeps_stale_query() {
        let temp_dir = TempDir::new().unwrap();
        let (mut registry, _telemetry) = new_registry(&temp_dir, vec![dead_backend()]);
        registry.start_or_attach("q", "q=x").unwrap();
        let first = wait(&registry, "q");

        registry.settings.stale_after = Duration::ZERO;
        let err = registry.start_or_attach("q", "q=foo(").unwrap_err();
        assert!(matches!(err, SiftError::MalformedQuery { .. }));
        assert!(Arc::ptr_eq(&first, &registry.get("q").unwrap()));
    }

    #[test]
    fn test_attach_and_stale_replacement() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _telemetry) = new_registry(&temp_dir, vec![dead_backend()]);

        assert_eq!(registry.start_or_attach("q", "q=x").unwrap(), StartOutcome::Started);
        assert_eq!(registry.start_or_attach("q", "q=x").unwrap(), StartOutcome::Attached);
        assert_eq!(registry.len(), 1);

        let mut stale = registry;
        stale.settings.stale_after = Duration::ZERO;
        let first = stale.get("q").unwrap();
        assert_eq!(stale.start_or_attach("q", "q=x").unwrap(), StartOutcome::Started);
        assert!(first.is_done());
        assert!(!Arc::ptr_eq(&first, &stale.get("q").unwrap()));
    }

    #[test]
    fn test_rejected_input_starts_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _telemetry) = new_registry(&temp_dir, vec![dead_backend()]);

        let err = registry.start_or_attach("q", "q=foo(").unwrap_err();
        assert!(matches!(err, SiftError::MalformedQuery { .. }));
        for id in ["", "..", "a/b", "a\\b"] {
            let err = registry.start_or_attach(id, "q=foo").unwrap_err();
            assert!(matches!(err, SiftError::InvalidQueryId { .. }), "{:?}", id);
        }
        assert!(registry.is_empty());
        assert!(!temp_dir.path().join("qr").join("q").exists());
    }

    #[test]
    fn test_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let (stalled, _handle) = fake_backend(vec![], Duration::from_secs(2));
        let (registry, _telemetry) = new_registry(&temp_dir, vec![stalled]);
        registry.start_or_attach("q", "q=x").unwrap();
        let mut sub = registry.subscribe("q").unwrap();

        assert!(registry.cancel("q").unwrap());
        assert!(!registry.cancel("q").unwrap());
        let events = drain(&mut sub);
        assert!(matches!(
            events[0].as_ref(),
            Event::Error(err) if err.kind == ErrorKind::Cancelled
        ));
        assert!(matches!(
            registry.package_page("q", 0),
            Err(SiftError::PageNotFound { page: 0, pages: 0 })
        ));
        assert!(matches!(
            registry.cancel("missing"),
            Err(SiftError::QueryNotFound { .. })
        ));
    }

    #[test]
    fn test_finished_queries_are_collected() {
        let temp_dir = TempDir::new().unwrap();
        let (mut registry, _telemetry) = new_registry(&temp_dir, vec![dead_backend()]);
        registry.settings.max_live_queries = 2;

        for id in ["q1", "q2"] {
            registry.start_or_attach(id, "q=x").unwrap();
            wait(&registry, id);
        }
        registry.start_or_attach("q3", "q=x").unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("q1").is_none());
        assert!(registry.get("q2").is_some());
        assert!(registry.get("q3").is_some());
    }

    #[test]
    fn test_introspect() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _telemetry) = new_registry(&temp_dir, vec![dead_backend()]);
        registry.start_or_attach("b", "q=x").unwrap();
        registry.start_or_attach("a", "q=y").unwrap();
        wait(&registry, "a");
        wait(&registry, "b");

        let stats = registry.introspect();
        assert_eq!(stats.failed_queries, 0);
        let ids: Vec<&str> = stats.queries.iter().map(|q| q.query_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(stats.queries[0].searchterm, "y");
        assert!(stats.queries.iter().all(|q| q.done && q.num_results == 0));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["queries"][0]["phase"], "done");
    }
}
