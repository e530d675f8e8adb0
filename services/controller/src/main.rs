//! Fleet controller
//!
//! Runs the scheduler and task runner against the configured compute
//! provider until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gcefleet_controller::{config::Settings, Controller};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fleet-controller", version, about)]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "GCEFLEET_SETTINGS_FILE")]
    config: Option<PathBuf>,

    /// Run a single pass, execute the tasks it emits and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    // Prefer RUST_LOG, fall back to the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| settings.logging.level.clone().into());
    if settings.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting fleet controller");
    info!(
        provider = ?settings.provider.kind,
        fleet_config = %settings.fleet.config_path.display(),
        "Configuration loaded"
    );

    let mut controller = match Controller::from_settings(&settings) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Failed to initialize controller");
            return Err(e.into());
        }
    };

    if args.once {
        let stats = controller.run_once().await?;
        info!(
            enqueued = stats.scanned.total(),
            adopted = ?stats.adopted,
            "Single pass complete"
        );
        return Ok(());
    }

    let (scheduler, runner, tasks) = controller.into_workers();

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            runner.run(tasks, shutdown_rx).await;
        }
    });

    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish (with timeout)
    let shutdown_timeout = Duration::from_secs(10);

    if tokio::time::timeout(shutdown_timeout, scheduler_handle)
        .await
        .is_err()
    {
        warn!("Scheduler worker did not shut down in time");
    }
    if tokio::time::timeout(shutdown_timeout, runner_handle)
        .await
        .is_err()
    {
        warn!("Task runner did not shut down in time");
    }

    info!("Fleet controller shutdown complete");
    Ok(())
}
