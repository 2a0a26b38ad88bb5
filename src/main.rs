//! Command-line runner for the metadata engine.
//!
//! Loads the configuration (first argument, default `fsmeta.json`),
//! registers its roots, optionally adds a directory given as the second
//! argument, and prints every reconciled change until Ctrl+C.

use anyhow::{Context, Result};
use fs_metadata_engine::{prelude::*, run_until_shutdown};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fs_metadata_engine=debug".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fsmeta.json"));
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .apply_env();

    println!("=== Filesystem Metadata Engine ===\n");
    println!("Database: {}", config.database_path.display());

    let engine = MetadataEngine::open(config).context("opening metadata store")?;
    let started = engine.start().await;
    println!("Registered {started} configured root(s)");

    if let Some(extra) = args.next().map(PathBuf::from) {
        let root = engine
            .register_root(RootConfig::new("cli", &extra))
            .await
            .with_context(|| format!("registering {}", extra.display()))?;
        println!("Watching: {} (id {})", root.path.display(), root.id);
    }

    for root in engine.roots() {
        let rows = engine.store().list_by_root(&root.path).await?.len();
        println!("  {} -> {} ({rows} entries)", root.id, root.path.display());
    }

    println!("\nPress Ctrl+C to exit\n---\n");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
        }
        println!("\nShutting down...");
        signal.cancel();
    });

    run_until_shutdown(&engine, shutdown, |note| {
        println!("[{}] {:?}: {}", note.root_id, note.kind, note.path);
    })
    .await;

    println!("Done!");
    Ok(())
}
