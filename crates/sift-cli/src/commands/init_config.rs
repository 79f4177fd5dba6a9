//! Init-config command - write the default configuration file.

use sift_core::Config;
use std::path::Path;

/// Run the init-config command.
pub fn run(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        println!(
            "Configuration already exists at {}. Use --force to overwrite.",
            path.display()
        );
        return Ok(());
    }

    Config::default().save_to(path)?;
    println!("Wrote default configuration to {}", path.display());
    println!("Add your backends under [backends] addresses before running a query.");

    Ok(())
}
