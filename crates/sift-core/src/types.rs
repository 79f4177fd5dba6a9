//! Core data types for Sift.
//!
//! This module defines the records exchanged with index backends, the records
//! written to the result spool, and the lightweight pointers used to address
//! spooled records without decoding them again.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Size of the live best-of buffer shown before all results are in.
pub const TOP_K: usize = 10;

/// Number of results in each `page_<n>.json` file.
pub const RESULTS_PER_PAGE: usize = 10;

/// Maximum number of results kept in each `pkg_<name>.json` file.
pub const RESULTS_PER_PACKAGE: usize = 2;

/// Number of packages in each per-package response page.
pub const PACKAGES_PER_PAGE: usize = 5;

/// Index of a backend in the configured backend list.
///
/// Backend indices are stable for the lifetime of a query: the spool file
/// `unsorted_<index>.json` and the progress counters are addressed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub usize);

impl BackendId {
    /// Create a new backend ID
    pub fn new(index: usize) -> Self {
        BackendId(index)
    }

    /// Get the raw index
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single match as reported by a backend.
///
/// `path_rank` is the pre-rank (computed from the path alone) and `ranking` the
/// post-rank (computed from the content). Fields this crate does not know about
/// are carried through to the spool untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Match {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub line: u32,

    #[serde(default)]
    pub context: String,

    #[serde(default)]
    pub ctxp2: String,

    #[serde(default)]
    pub ctxp1: String,

    #[serde(default)]
    pub ctxn1: String,

    #[serde(default)]
    pub ctxn2: String,

    #[serde(default)]
    pub path_rank: f32,

    #[serde(default)]
    pub ranking: f32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Match {
    /// Create a match with the given path and scores
    pub fn new(path: impl Into<String>, path_rank: f32, ranking: f32) -> Self {
        Match {
            path: path.into(),
            path_rank,
            ranking,
            ..Default::default()
        }
    }
}

/// A search hit as stored in the spool and shown to clients.
///
/// `hit.ranking` holds the combined ranking once the record has passed through
/// the merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultRecord {
    #[serde(flatten)]
    pub hit: Match,

    pub package: String,
}

impl ResultRecord {
    /// Wrap a backend match, deriving its package from the path.
    pub fn new(hit: Match) -> Self {
        let package = package_of(&hit.path).to_string();
        ResultRecord { hit, package }
    }

    /// The combined ranking used for ordering
    pub fn ranking(&self) -> f32 {
        self.hit.ranking
    }

    /// Serialize as a single JSON line tagged with `"Type": "result"`.
    pub fn to_json_line(&self) -> serde_json::Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            #[serde(rename = "Type")]
            kind: &'static str,
            #[serde(flatten)]
            record: &'a ResultRecord,
        }

        let mut line = serde_json::to_vec(&Tagged {
            kind: "result",
            record: self,
        })?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Derive the owning package from a result path.
///
/// Backends prefix every path with `<package>_<version>/`, so the package is
/// everything before the first underscore. Paths without an underscore are
/// treated as their own package.
pub fn package_of(path: &str) -> &str {
    match path.find('_') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// File name of the per-package result file for `package`.
pub fn package_file_name(package: &str) -> String {
    format!("pkg_{}.json", package.replace('/', "%2F"))
}

/// 64-bit hash of a result path, used as the ranking tie-breaker.
pub fn path_hash(path: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(path.as_bytes())
}

/// A record as it arrives on a backend stream.
///
/// Results and progress updates share one wire shape; the optional `Type`
/// field distinguishes them and defaults to a result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireRecord {
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub files_processed: Option<i64>,

    #[serde(default)]
    pub files_total: Option<i64>,

    #[serde(flatten)]
    pub hit: Match,
}

/// A decoded backend record
#[derive(Debug, Clone, PartialEq)]
pub enum BackendRecord {
    /// A search hit
    Result(Match),

    /// Progress through the backend's share of the corpus.
    /// `files_total` is `None` when the backend did not report it.
    Progress {
        files_processed: u64,
        files_total: Option<u64>,
    },

    /// A record type this crate does not handle
    Unknown(String),
}

impl From<WireRecord> for BackendRecord {
    fn from(record: WireRecord) -> Self {
        match record.kind.as_deref() {
            None | Some("") | Some("result") => BackendRecord::Result(record.hit),
            Some("progress") => BackendRecord::Progress {
                files_processed: record.files_processed.unwrap_or(0).max(0) as u64,
                files_total: record
                    .files_total
                    .filter(|total| *total >= 0)
                    .map(|total| total as u64),
            },
            Some(other) => BackendRecord::Unknown(other.to_string()),
        }
    }
}

/// Locates one spooled result record without holding its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPointer {
    /// Backend whose spool file holds the record
    pub backend: BackendId,

    /// Combined ranking, primary sort key
    pub ranking: f32,

    /// Byte offset of the record inside the spool file
    pub offset: u64,

    /// Length of the record in bytes
    pub length: u64,

    /// Tie-breaker for identical rankings, independent of arrival order
    pub path_hash: u64,

    /// Interned package name
    pub package: Arc<str>,
}

/// Deduplicating pool of package names.
///
/// Every name handed out is shared, so thousands of pointers into the same
/// package cost one allocation. The pool doubles as the set of packages seen.
#[derive(Debug, Default)]
pub struct PackagePool {
    names: HashSet<Arc<str>>,
}

impl PackagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `name`, adding it if new.
    pub fn intern(&mut self, name: &str) -> Arc<str> {
        if let Some(existing) = self.names.get(name) {
            return existing.clone();
        }
        let shared: Arc<str> = Arc::from(name);
        self.names.insert(shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All package names in lexical order.
    pub fn sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|n| n.to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_of() {
        assert_eq!(package_of("pkgX_1.0/src/foo.c"), "pkgX");
        assert_eq!(package_of("i3-wm_4.8-1/i3bar/src/xcb.c"), "i3-wm");
        assert_eq!(package_of("noversion"), "noversion");
        assert_eq!(package_of("_leading"), "");
    }

    #[test]
    fn test_package_file_name() {
        assert_eq!(package_file_name("pkgX"), "pkg_pkgX.json");
        assert_eq!(package_file_name("a/b"), "pkg_a%2Fb.json");
    }

    #[test]
    fn test_path_hash_is_stable() {
        assert_eq!(path_hash("pkgX_foo.c"), path_hash("pkgX_foo.c"));
        assert_ne!(path_hash("pkgX_foo.c"), path_hash("pkgX_bar.c"));
    }

    #[test]
    fn test_wire_record_defaults_to_result() {
        let wire: WireRecord = serde_json::from_str(
            r#"{"Path":"pkgX_foo.c","Line":3,"PathRank":0.8,"Ranking":0.5,"Context":"int x;"}"#,
        )
        .unwrap();
        match BackendRecord::from(wire) {
            BackendRecord::Result(hit) => {
                assert_eq!(hit.path, "pkgX_foo.c");
                assert_eq!(hit.line, 3);
                assert_eq!(hit.context, "int x;");
                assert!((hit.path_rank - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_wire_record_progress() {
        let wire: WireRecord =
            serde_json::from_str(r#"{"Type":"progress","FilesProcessed":4,"FilesTotal":9}"#)
                .unwrap();
        assert_eq!(
            BackendRecord::from(wire),
            BackendRecord::Progress {
                files_processed: 4,
                files_total: Some(9)
            }
        );

        let wire: WireRecord =
            serde_json::from_str(r#"{"Type":"progress","FilesProcessed":0,"FilesTotal":-1}"#)
                .unwrap();
        assert_eq!(
            BackendRecord::from(wire),
            BackendRecord::Progress {
                files_processed: 0,
                files_total: None
            }
        );
    }

    #[test]
    fn test_wire_record_unknown_type() {
        let wire: WireRecord = serde_json::from_str(r#"{"Type":"heartbeat"}"#).unwrap();
        assert_eq!(
            BackendRecord::from(wire),
            BackendRecord::Unknown("heartbeat".to_string())
        );
    }

    #[test]
    fn test_extra_match_fields_survive() {
        let wire: WireRecord =
            serde_json::from_str(r#"{"Path":"a_b.c","Highlight":[1,2]}"#).unwrap();
        let hit = match BackendRecord::from(wire) {
            BackendRecord::Result(hit) => hit,
            other => panic!("unexpected record {:?}", other),
        };
        let line = ResultRecord::new(hit).to_json_line().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["Type"], "result");
        assert_eq!(value["Package"], "a");
        assert_eq!(value["Highlight"], serde_json::json!([1, 2]));
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn test_package_pool_interns() {
        let mut pool = PackagePool::new();
        let a = pool.intern("zsh");
        let b = pool.intern("zsh");
        pool.intern("bash");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.sorted(), vec!["bash".to_string(), "zsh".to_string()]);
    }
}
