//! # Sift Core Library
//!
//! This crate fans a code search query out to a fixed set of index backends,
//! merges their streamed results into a live best-of ranking, and persists the
//! complete result set as paginated and per-package JSON files.
//!
//! ## Architecture
//!
//! - **Registry** (`registry`): Starts, attaches to and garbage-collects queries
//! - **Query** (`query`): Per-query state shared by all backend workers
//! - **Client** (`client`): One streaming connection per backend
//! - **Ranking** (`ranking`): Combined ranking and the live top ten
//! - **Spool** (`spool`): Per-backend append-only result files plus pointers
//! - **Progress** (`progress`): Completion detection across backends
//! - **Writer** (`writer`): Final pages, package files and the package list
//! - **Reclaim** (`reclaim`): Disk headroom enforcement
//! - **Events** (`events`): Per-query event log and subscriptions
//! - **Rewrite** (`rewrite`): Client query to backend request translation
//! - **Telemetry** (`telemetry`): Finished-query reporting
//! - **Config** (`config`): Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use sift_core::{Config, QueryRegistry};
//! use std::time::Duration;
//!
//! let registry = QueryRegistry::from_config(&Config::load()?)?;
//! registry.start_or_attach("q1", "q=XCreateWindow")?;
//!
//! let mut events = registry.subscribe("q1")?;
//! while !events.is_finished() {
//!     for event in events.next_batch(Duration::from_secs(1)) {
//!         println!("{}", String::from_utf8_lossy(&event.payload()?));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod progress;
pub mod query;
pub mod ranking;
pub mod reclaim;
pub mod registry;
pub mod rewrite;
pub mod spool;
pub mod telemetry;
pub mod types;
pub mod writer;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, SiftError};
pub use events::{ErrorKind, Event, EventBus, Subscription};
pub use query::{Phase, QueryState, QueryStats};
pub use reclaim::{ReclaimReport, SpaceProbe, SpaceReclaimer};
pub use registry::{QueryRegistry, RegistrySettings, RegistryStats, StartOutcome};
pub use rewrite::{search_query_string, BackendRequest, DefaultRewriter, QueryRewriter};
pub use telemetry::Telemetry;
pub use types::{BackendId, Match, ResultRecord};
