//! Configuration management for Sift.
//!
//! Configuration is stored in TOML format in a platform-appropriate location.
//! Every section has defaults, so an empty or missing file yields a working
//! configuration that talks to no backends.

use crate::error::{Result, SiftError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure for Sift.
///
/// ## Example Configuration File (sift.toml)
///
/// ```toml
/// [general]
/// results_dir = "/var/cache/sift/qr"
///
/// [backends]
/// addresses = ["index0:26082", "index1:26082"]
/// connect_timeout_secs = 5
/// read_timeout_secs = 10
///
/// [storage]
/// headroom_bytes = 2147483648
///
/// [telemetry]
/// host = "influx:8086"
/// database = "sift"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Index backends queries are fanned out to
    pub backends: BackendsConfig,

    /// Results volume budget
    pub storage: StorageConfig,

    /// Query registry tuning
    pub registry: RegistryConfig,

    /// Optional time-series sink for finished queries
    pub telemetry: TelemetryConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding one subdirectory of result files per query
    pub results_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            results_dir: std::env::temp_dir().join("qr"),
            log_level: "info".to_string(),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// `host:port` of every index backend, in backend-index order
    pub addresses: Vec<String>,

    /// Connect timeout per backend
    pub connect_timeout_secs: u64,

    /// Idle timeout for each read from a backend stream
    pub read_timeout_secs: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        BackendsConfig {
            addresses: Vec::new(),
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Free bytes to keep available on the results volume
    pub headroom_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            headroom_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Query registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Soft cap on live query states before finished ones are collected
    pub max_live_queries: usize,

    /// Age after which a query may be replaced by a fresh run
    pub stale_after_secs: u64,

    /// How long per-package readers wait for a query to complete
    pub completion_wait_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_live_queries: 10,
            stale_after_secs: 30 * 60,
            completion_wait_secs: 60,
        }
    }
}

/// Telemetry configuration. Without a host, telemetry is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `host:port` of the InfluxDB-compatible sink
    pub host: Option<String>,

    /// Database name
    pub database: String,

    /// Username
    pub username: String,

    /// Password
    pub password: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            host: None,
            database: "sift".to_string(),
            username: "root".to_string(),
            password: "root".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default config if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Config::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents).map_err(|e| SiftError::ConfigError {
            reason: format!("Failed to parse config: {}", e),
        })?;

        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Saving configuration");
        let contents = toml::to_string_pretty(self).map_err(|e| SiftError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "sift").ok_or_else(|| SiftError::ConfigError {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(dirs.config_dir().join("sift.toml"))
    }

    /// Check that the configuration can drive a query.
    pub fn validate(&self) -> Result<()> {
        if self.backends.addresses.is_empty() {
            return Err(SiftError::ConfigError {
                reason: "no backends configured".to_string(),
            });
        }
        if let Some(bad) = self
            .backends
            .addresses
            .iter()
            .find(|addr| addr.trim().is_empty())
        {
            return Err(SiftError::ConfigError {
                reason: format!("empty backend address {:?}", bad),
            });
        }
        if self.backends.connect_timeout_secs == 0 || self.backends.read_timeout_secs == 0 {
            return Err(SiftError::ConfigError {
                reason: "backend timeouts must be at least one second".to_string(),
            });
        }
        if self.registry.max_live_queries == 0 {
            return Err(SiftError::ConfigError {
                reason: "registry.max_live_queries must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.backends.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.backends.read_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.registry.stale_after_secs)
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_secs(self.registry.completion_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backends.connect_timeout_secs, 5);
        assert_eq!(config.backends.read_timeout_secs, 10);
        assert_eq!(config.storage.headroom_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.registry.max_live_queries, 10);
        assert_eq!(config.stale_after(), Duration::from_secs(1800));
        assert!(config.telemetry.host.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let mut config = Config::default();
        config.backends.addresses = vec!["a:1".to_string(), "b:2".to_string()];
        config.telemetry.host = Some("influx:8086".to_string());

        config.save_to(&config_path).unwrap();
        let loaded = Config::load_from(&config_path).unwrap();

        assert_eq!(loaded.backends.addresses, config.backends.addresses);
        assert_eq!(loaded.telemetry.host.as_deref(), Some("influx:8086"));
    }

    #[test]
    fn test_load_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.registry.completion_wait_secs, 60);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        fs::write(&config_path, "[backends]\naddresses = [\"x:1\"]\n").unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.backends.addresses, vec!["x:1".to_string()]);
        assert_eq!(config.backends.read_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        fs::write(&config_path, "[backends\n").unwrap();

        let result = Config::load_from(&config_path);
        assert!(matches!(result, Err(SiftError::ConfigError { .. })));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.backends.addresses = vec!["a:1".to_string()];
        assert!(config.validate().is_ok());

        config.backends.addresses.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.backends.addresses = vec!["a:1".to_string()];

        config.backends.read_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SiftError::ConfigError { .. })));

        config.backends.read_timeout_secs = 10;
        config.backends.connect_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(SiftError::ConfigError { .. })));
    }
}
