//! # Sift CLI
//!
//! Command-line interface for the Sift code search aggregator.
//!
//! ## Commands
//!
//! - `sift query <term>` - Fan a query out to the backends and stream results
//! - `sift reclaim` - Free space on the results volume
//! - `sift init-config` - Write the default configuration file
//!
//! ## Example Usage
//!
//! ```bash
//! # Search two local backends, showing the second page of packages
//! sift query XCreateWindow --backend localhost:28082 --backend localhost:28083 --per-package 1
//!
//! # Event stream as JSON lines
//! sift query -o json 'i3bar.*xcb'
//! ```

mod app;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sift - code search fan-out and merge
#[derive(Parser)]
#[command(name = "sift")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory for query results (overrides the configuration file)
    #[arg(long, global = true, env = "SIFT_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Backend address, host:port (repeatable, overrides the configuration file)
    #[arg(short, long = "backend", global = true, env = "SIFT_BACKENDS", value_delimiter = ',')]
    backends: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query against every backend
    Query {
        /// Search term (a regular expression)
        term: String,

        /// Query id, also the name of the results directory
        #[arg(long)]
        id: Option<String>,

        /// Print this page of per-package results once the query is done
        #[arg(short, long)]
        per_package: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        output: OutputFormat,
    },

    /// Delete old query results until the configured headroom is free
    Reclaim,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => sift_core::Config::default_config_path()?,
    };
    let mut config = sift_core::Config::load_from(&config_path)?;

    // Setup logging
    let log_level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.general.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    if let Some(results_dir) = cli.results_dir {
        config.general.results_dir = results_dir;
    }
    if !cli.backends.is_empty() {
        config.backends.addresses = cli.backends;
    }

    // Execute command
    match cli.command {
        Commands::Query {
            term,
            id,
            per_package,
            output,
        } => commands::query::run(config, &term, id, per_package, output),
        Commands::Reclaim => commands::reclaim::run(config),
        Commands::InitConfig { force } => commands::init_config::run(&config_path, force),
    }
}
