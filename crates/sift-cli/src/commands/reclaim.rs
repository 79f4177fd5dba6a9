//! Reclaim command - free space on the results volume.

use sift_core::{Config, SpaceReclaimer};

/// Run the reclaim command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let results_dir = &config.general.results_dir;
    let reclaimer = SpaceReclaimer::new(results_dir, config.storage.headroom_bytes);

    let report = reclaimer.ensure_headroom()?;
    for dir in &report.removed {
        println!("Removed {}", dir.display());
    }
    println!(
        "{} query directories removed, {:.2} GB available in {}",
        report.removed.len(),
        report.available as f64 / (1024.0 * 1024.0 * 1024.0),
        results_dir.display()
    );

    Ok(())
}
