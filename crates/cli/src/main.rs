//! sqlcache maintenance binary.
//!
//! Opens an existing cache directory, runs one maintenance command and prints
//! the result as JSON on stdout. Logging goes to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlcache_core::{AppConfig, Engine};
use tracing_subscriber::EnvFilter;

/// Inspect and maintain a sqlcache directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache directory; overrides the configured `cache_dir`
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print engine and per-shard statistics (default)
    Stats,
    /// List live entries, newest first within each shard
    List {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Doom every entry
    Clear,
    /// Doom entries last used at or after an RFC 3339 timestamp
    DoomSince { since: DateTime<Utc> },
    /// Run WAL checkpoints on every shard
    Checkpoint,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }

    tracing::info!(cache_dir = %config.cache_dir.display(), shards = config.shard_count, "Opening cache");
    let engine = Engine::open(config.engine_config()).await.context("opening cache")?;
    engine.wait_for_index_load().await;

    let output = match args.command.unwrap_or(Command::Stats) {
        Command::Stats => serde_json::to_value(engine.stats())?,
        Command::List { limit } => {
            let mut iterator = engine.iterator();
            let mut entries = Vec::new();
            while entries.len() < limit {
                let Some(entry) = iterator.open_next_entry().await? else {
                    break;
                };
                let snapshot = entry.snapshot().context("engine closed while listing")?;
                entries.push(json!({
                    "key": entry.key().as_str(),
                    "shard": engine.shard_for_key(entry.key()),
                    "res_id": entry.res_id(),
                    "last_used": snapshot.last_used,
                    "body_end": snapshot.body_end,
                    "header_len": snapshot.head.len(),
                }));
            }
            json!({ "entries": entries })
        }
        Command::Clear => {
            let before = engine.entry_count();
            engine.doom_all_entries().await?;
            json!({ "doomed": before, "entry_count": engine.entry_count() })
        }
        Command::DoomSince { since } => {
            let before = engine.entry_count();
            engine.doom_entries_since(since).await?;
            json!({ "doomed": before - engine.entry_count(), "entry_count": engine.entry_count() })
        }
        Command::Checkpoint => {
            engine.on_idle().await?;
            json!({ "checkpointed": engine.shard_count() })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    engine.close().await?;
    Ok(())
}
