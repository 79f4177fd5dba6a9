//! Query command - fan a search out to the backends.

use crate::app::App;
use crate::OutputFormat;
use sift_core::{search_query_string, Config, Event, StartOutcome};
use std::time::{Duration, Instant};

/// How long to wait for events before checking again.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the query command.
pub fn run(
    config: Config,
    term: &str,
    id: Option<String>,
    per_package: Option<usize>,
    output: OutputFormat,
) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let id = id.unwrap_or_else(|| chrono::Utc::now().format("q%Y%m%d-%H%M%S%3f").to_string());

    let start = Instant::now();
    if app.registry.start_or_attach(&id, &search_query_string(term))? == StartOutcome::Attached {
        eprintln!("Attached to running query {}", id);
    }

    let mut events = app.registry.subscribe(&id)?;
    while !events.is_finished() {
        for event in events.next_batch(POLL_INTERVAL) {
            match output {
                OutputFormat::Text => print_event(&event),
                OutputFormat::Json => {
                    let payload = event.payload()?;
                    if !payload.is_empty() {
                        println!("{}", String::from_utf8_lossy(&payload));
                    }
                }
            }
        }
    }
    let elapsed = start.elapsed();

    let stats = app.registry.introspect();
    let summary = stats.queries.iter().find(|q| q.query_id == id);
    match output {
        OutputFormat::Text => {
            if let Some(summary) = summary {
                eprintln!();
                eprintln!(
                    "Query {} finished in {:.3}ms: {} results in {} packages, {} pages",
                    id,
                    elapsed.as_secs_f64() * 1000.0,
                    summary.num_results,
                    summary.num_packages,
                    summary.num_result_pages
                );
                eprintln!(
                    "Results in {}",
                    app.config.general.results_dir.join(&id).display()
                );
            }
        }
        OutputFormat::Json => {
            if let Some(summary) = summary {
                println!("{}", serde_json::to_string(summary)?);
            }
        }
    }

    if let Some(page) = per_package {
        let response = app.registry.package_page(&id, page)?;
        match output {
            OutputFormat::Text => {
                let value: serde_json::Value = serde_json::from_str(&response)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Json => println!("{}", response),
        }
    }

    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Result(record) => {
            println!(
                "{:.4} {}:{}  {}",
                record.ranking(),
                record.hit.path,
                record.hit.line,
                record.hit.context.trim()
            );
        }
        Event::Progress(progress) => {
            eprintln!(
                "progress: {}/{} files, {} results",
                progress.files_processed, progress.files_total, progress.results
            );
        }
        Event::Pagination(pagination) => {
            eprintln!("{} result pages written", pagination.result_pages);
        }
        Event::Error(error) => {
            eprintln!("error: {:?}", error.kind);
        }
        Event::Done => {}
    }
}
