//! Event export.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::EventRecord;

/// Default export filename, timestamped to the minute.
pub fn default_output_path(entity: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M");
    PathBuf::from(format!("events_{}_{}.json", entity, stamp))
}

/// Write the final event collection as pretty-printed JSON.
pub fn write_events(events: &[EventRecord], path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(events)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write events to {}", path.display()))?;
    tracing::info!(count = events.len(), path = %path.display(), "events exported");
    Ok(())
}

/// Print the event collection to stdout.
pub fn print_events(events: &[EventRecord]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(events)?);
    Ok(())
}
