//! Application state management.

use sift_core::{Config, QueryRegistry};
use tracing::info;

/// Shared application state.
pub struct App {
    /// Configuration
    pub config: Config,

    /// Running and finished queries
    pub registry: QueryRegistry,
}

impl App {
    /// Create a new application instance.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let registry = QueryRegistry::from_config(&config)?;

        info!(
            results_dir = %config.general.results_dir.display(),
            backends = config.backends.addresses.len(),
            telemetry = config.telemetry.host.is_some(),
            "Application initialized"
        );

        Ok(App { config, registry })
    }
}
