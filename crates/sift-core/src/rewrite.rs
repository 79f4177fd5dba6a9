//! Translation of a client query into the request sent to every backend.

use crate::error::{Result, SiftError};
use regex::Regex;
use serde::Serialize;
use url::form_urlencoded;

/// The request written to each backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRequest {
    /// The search pattern
    #[serde(rename = "Query")]
    pub query: String,

    /// The normalized query string the pattern came from
    #[serde(rename = "URL")]
    pub url: String,
}

impl BackendRequest {
    /// Encode as the single JSON object sent to a backend.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut payload = serde_json::to_vec(self)?;
        payload.push(b'\n');
        Ok(payload)
    }
}

/// Build the query string for a plain search term, as [`DefaultRewriter`]
/// expects it.
pub fn search_query_string(term: &str) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("q", term)
        .finish()
}

/// Turns the raw client query into a [`BackendRequest`].
///
/// Errors are reported to the client as a malformed query; no backend is
/// contacted.
pub trait QueryRewriter: Send + Sync {
    fn rewrite(&self, raw: &str) -> Result<BackendRequest>;
}

/// Reads a URL query string such as `q=foo&literal=1`.
///
/// The `q` parameter is the pattern and must be a valid regular expression.
/// Every parameter is passed along, re-encoded, in `URL`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRewriter;

impl QueryRewriter for DefaultRewriter {
    fn rewrite(&self, raw: &str) -> Result<BackendRequest> {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let pairs: Vec<(String, String)> = form_urlencoded::parse(raw.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let malformed = |reason: String| SiftError::MalformedQuery {
            query: raw.to_string(),
            reason,
        };

        let query = pairs
            .iter()
            .find(|(k, _)| k == "q")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        if query.trim().is_empty() {
            return Err(malformed("missing search term".to_string()));
        }
        if let Err(e) = Regex::new(&query) {
            return Err(malformed(format!("invalid pattern: {}", e)));
        }

        let normalized = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();

        Ok(BackendRequest {
            query,
            url: format!("?{}", normalized),
        })
    }
}
