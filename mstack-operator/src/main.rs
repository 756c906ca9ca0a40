use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mstack_operator::{Operator, OperatorConfig, SqliteClient};
use mstack_tasks::{MemoryClient, ResourceClient, Shutdown};

#[derive(Parser)]
#[command(name = "mstack-operator")]
#[command(about = "mstack operator - reconciles the monitoring stack components")]
struct Args {
    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the resource store database
    #[arg(short, long, default_value = "/var/lib/mstack")]
    state_dir: PathBuf,

    /// Run in development mode (ephemeral in-memory store)
    #[arg(long)]
    dev: bool,

    /// Run a single reconciliation pass and exit
    #[arg(long)]
    once: bool,

    /// Print the steps every task would run and exit without touching the store
    #[arg(long)]
    plan: bool,

    /// Leave readiness to an external agent instead of marking every write as
    /// observed
    #[arg(long)]
    no_auto_ready: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mstack_operator=info".parse()?)
                .add_directive("mstack_tasks=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let settings = OperatorConfig::load_or_default(args.config.as_deref())
        .await
        .context("failed to load configuration")?;

    let client: Arc<dyn ResourceClient> = if args.dev || args.plan {
        if args.no_auto_ready {
            warn!("--no-auto-ready has no effect on the in-memory store");
        }
        Arc::new(MemoryClient::new())
    } else {
        tokio::fs::create_dir_all(&args.state_dir)
            .await
            .with_context(|| format!("failed to create {}", args.state_dir.display()))?;
        let dir = args
            .state_dir
            .to_str()
            .context("state directory is not valid UTF-8")?;
        Arc::new(SqliteClient::new(dir, !args.no_auto_ready).await?)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut operator = Operator::new(settings, client, Shutdown::new(shutdown_rx.clone()));

    if args.plan {
        for (task, sequence) in operator.preview().await {
            match sequence {
                Ok(sequence) => {
                    println!("{} ({}):", task, sequence.direction);
                    for (i, step) in sequence.iter().enumerate() {
                        println!("  {:>2}. {}", i + 1, step);
                    }
                }
                Err(e) => println!("{}: {}", task, e.detailed()),
            }
        }
        return Ok(());
    }

    if args.once {
        operator
            .reconcile_once()
            .await
            .context("reconciliation pass failed")?;
        info!("Reconciliation pass complete");
        return Ok(());
    }

    if let Some(path) = args.config {
        operator = operator.with_config_path(path);
    }

    // Wait for shutdown signal
    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!(dev = args.dev, "Starting mstack operator");
    operator.run(Shutdown::new(shutdown_rx)).await;
    Ok(())
}
