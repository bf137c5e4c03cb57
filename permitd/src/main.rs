use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use permitd::config::Config;
use permitd::coordinator::Coordinator;
use permitd::idle;
use permitd::ipc::IpcServer;
use permitd::slack::{ChatPort, SlackHandler};
use permitd::state::StateStore;

/// How long component tasks get to wind down after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "permitd", version)]
#[command(about = "Remote permission approval daemon (Slack bridge)")]
struct Cli {
    /// Path to config file (default: ~/.config/permitd/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Configuration error: {}", problem);
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting permitd");

    let state = Arc::new(StateStore::new());

    let (actions_tx, mut actions_rx) = mpsc::channel(32);
    let slack = SlackHandler::new(config.slack.clone(), actions_tx);
    let socket_mode = tokio::spawn(Arc::clone(&slack).run_socket_mode());

    let coordinator = Coordinator::new(
        Arc::clone(&state),
        slack as Arc<dyn ChatPort>,
        Duration::from_secs(config.daemon.request_timeout),
    );

    let (idle_tx, mut idle_rx) = mpsc::channel(8);
    let backend = idle::create_backend(&config, idle_tx.clone())
        .context("no usable idle detection backend")?;
    let idle_task = tokio::spawn(idle::supervise(backend, idle_tx));

    let idle_pump = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            while let Some(is_idle) = idle_rx.recv().await {
                coordinator.on_idle_change(is_idle).await;
            }
        }
    });
    let button_pump = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            while let Some(event) = actions_rx.recv().await {
                coordinator.on_button(event).await;
            }
        }
    });

    let mut ipc = IpcServer::new(
        config.daemon.socket_path.clone(),
        config.ignored_notification_types(),
    );
    ipc.bind().await.context("failed to create IPC endpoint")?;

    info!("Daemon started");

    tokio::select! {
        result = ipc.run(coordinator.clone()) => {
            result.context("IPC server failed")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // New connections are no longer accepted; retire what is in flight,
    // then give the component tasks a bounded window to wind down.
    coordinator.shutdown().await;

    let tasks = [socket_mode, idle_task, idle_pump, button_pump];
    for task in &tasks {
        task.abort();
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("Timed out waiting for component tasks to stop");
    }

    ipc.cleanup();
    info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
