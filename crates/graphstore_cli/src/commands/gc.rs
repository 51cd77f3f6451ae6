//! GC command implementation.

use super::open_database;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

/// Runs the gc command.
pub fn run(path: &Path, types: &Path, budget_ms: u64) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path, types)?;
    if db.config().root_type_id.is_none() {
        return Err("The type descriptor file names no root type; nothing would be collected".into());
    }

    info!(path = %path.display(), budget_ms, "starting garbage collection");
    let started = Instant::now();
    let complete = db.issue_garbage_collection(Duration::from_millis(budget_ms))?;
    let elapsed = started.elapsed();
    let stats = db.stats();
    db.close()?;

    println!(
        "Swept {} entities in {} sweeps ({:.1} ms)",
        stats.entities_swept,
        stats.sweeps,
        elapsed.as_secs_f64() * 1000.0
    );
    if complete {
        println!("✓ Garbage collection complete");
        Ok(())
    } else {
        println!("✗ Budget exhausted before collection completed");
        Err("Garbage collection incomplete".into())
    }
}
