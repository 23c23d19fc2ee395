//! `studyweave cache stats|prune|clear`

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::args::CacheCommands;
use crate::{CacheStore, Config, Invalidation, emit_jcs};

#[derive(Debug, Serialize)]
struct CacheStatsOutput<'a> {
    dir: &'a str,
    enabled: bool,
    phase1_entries: u64,
    phase2_entries: u64,
    bytes: u64,
}

pub fn execute_cache_command(command: &CacheCommands, config: &Config) -> Result<()> {
    let store = CacheStore::open(config.cache_dir())?;

    match command {
        CacheCommands::Stats { json } => {
            let usage = store.disk_usage()?;
            let output = CacheStatsOutput {
                dir: store.dir().as_str(),
                enabled: config.cache.enabled,
                phase1_entries: usage.phase1_entries,
                phase2_entries: usage.phase2_entries,
                bytes: usage.bytes,
            };
            if *json {
                println!("{}", emit_jcs(&output).context("Failed to emit cache stats JSON")?);
            } else {
                println!("Cache: {}", output.dir);
                if !output.enabled {
                    println!("  (disabled in configuration)");
                }
                println!("  phase1 entries: {}", output.phase1_entries);
                println!("  phase2 entries: {}", output.phase2_entries);
                println!("  size on disk:   {} bytes", output.bytes);
            }
        }
        CacheCommands::Prune => {
            let removed = store.invalidate(Invalidation::Expired);
            println!("Removed {removed} expired or unreadable entries from {}", store.dir());
        }
        CacheCommands::Clear { phase } => {
            let scope = phase.map_or(Invalidation::All, Invalidation::Phase);
            let removed = store.invalidate(scope);
            match phase {
                Some(phase) => println!("Removed {removed} {phase} entries from {}", store.dir()),
                None => println!("Removed {removed} entries from {}", store.dir()),
            }
        }
    }
    Ok(())
}
