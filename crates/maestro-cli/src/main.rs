//! Maestro daemon entry point.
//!
//! The composition root: configuration, store, coordinator, and scheduler
//! are constructed once here and run until ctrl-c. The HTTP/WebSocket
//! transport is a separate deployment concern; it talks to the engine
//! through the coordinator and the event bus.

use anyhow::Context;
use clap::{Parser, Subcommand};
use maestro_agent::ProcessFactory;
use maestro_config::Config;
use maestro_runtime::SessionCoordinator;
use maestro_scheduler::TaskScheduler;
use maestro_store::Store;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "maestro", about = "Agent-CLI orchestration engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted.
    Serve,
    /// Validate the environment configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig => check_config(),
        Command::Serve => serve().await,
    }
}

fn check_config() -> anyhow::Result<()> {
    let config = Config::from_env().context("configuration is invalid")?;
    println!("configuration ok");
    println!("  storage_root:  {}", config.storage_root.display());
    println!("  archive_store: {}", config.archive_store.display());
    println!("  compression:   {}", config.archive_compression);
    println!("  model:         {}", config.default_model);
    println!("recognized variables:");
    for var in maestro_config::env::RECOGNIZED_VARS {
        println!("  {var}");
    }
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env().context("configuration is invalid")?;
    let store = Arc::new(Store::open(&config.store_path()).context("failed to open the store")?);

    let coordinator = Arc::new(
        SessionCoordinator::new(config, Arc::clone(&store), ProcessFactory)
            .context("failed to assemble the coordinator")?,
    );
    let snapshotter = coordinator.spawn_snapshotter();

    let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&coordinator)));
    let scheduled = scheduler.load().context("failed to load scheduled tasks")?;
    info!(scheduled, "engine up");

    let scheduler_cancel = scheduler.cancel_token();
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    scheduler_cancel.cancel();
    let _ = scheduler_task.await;
    snapshotter.abort();
    Ok(())
}
