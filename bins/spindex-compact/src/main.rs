//! Offline history compaction.
//!
//! Rewrites every script hash's history into as few rows as possible and
//! resets the flush counter, so a server that stopped with exit status 65
//! can start again. Run it while the server is stopped; an interrupted run
//! resumes where it left off.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use spindex_node_lib::{IndexDb, RocksStore, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "spindex-compact", version, about = "Compact the spindex history index")]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory holding the index
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Network: mainnet, testnet or regtest
    #[arg(long)]
    network: Option<String>,

    /// Transactions per compacted history row; the configured value when unset
    #[arg(long)]
    row_entries: Option<usize>,
}

fn run(args: Args) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    if let Some(network) = args.network {
        config.network = network;
    }
    let row_entries = args.row_entries.unwrap_or(config.max_hist_row_entries);
    let coin = config.coin()?;
    let path = config.db_path();
    info!(path = %path.display(), row_entries, "compacting history");

    let store = Arc::new(RocksStore::open(&path).with_context(|| format!("cannot open {}", path.display()))?);
    let db = IndexDb::open(store.clone(), coin, config.effective_max_flush_count())?;
    let before = db.flush_state().flush_count;
    let after = db.compact_history(row_entries)?;
    store.compact()?;
    info!(before, after, "compaction finished");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("compaction failed: {e:#}");
        process::exit(1);
    }
}
