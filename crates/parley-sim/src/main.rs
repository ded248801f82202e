//! # parley-sim
//!
//! Replays a scripted conversation session against the sync engine:
//! - seeds an in-memory remote with a multi-day history and unseen tail
//! - opens the conversation on top of the SQLite local store
//! - paginates both ways, catches up on unseen messages
//! - plays remote edits, deletions and a reply, then tears down
//!
//! Engine behaviour is observable through `RUST_LOG`.

mod config;
mod scenario;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;
use parley_sync::SyncConfig;

use crate::config::SimConfig;
use crate::scenario::Scenario;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_sync=debug")),
        )
        .init();

    info!("Starting Parley simulator v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let sim = SimConfig::from_env();
    let sync = SyncConfig::from_env();
    info!(?sim, ?sync, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the local store
    // -----------------------------------------------------------------------
    let database = match &sim.db_path {
        _ if sim.in_memory() => Database::open_in_memory(),
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("opening local store")?;
    info!(path = ?database.path(), "Local store ready");

    // -----------------------------------------------------------------------
    // 4. Seed the remote and replay the session
    // -----------------------------------------------------------------------
    let scenario = Scenario::new(sim);
    scenario.seed();

    tokio::select! {
        result = scenario.run(Arc::new(database), sync) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
