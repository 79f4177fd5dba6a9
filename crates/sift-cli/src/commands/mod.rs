//! Subcommand implementations.

pub mod init_config;
pub mod query;
pub mod reclaim;
