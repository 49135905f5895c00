use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use foreman_config::ForemanConfig;
use foreman_runtime::Foreman;

mod daemon;

#[derive(Parser)]
#[command(name = "foreman", about = "Multi-project supervisor daemon", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "foreman.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor in the foreground.
    Run,
    /// Manage the background daemon process.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    Start {
        #[arg(long)]
        force: bool,
    },
    Stop,
    Restart,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // the spawned daemon child re-enters here with this marker set
    if std::env::var("FOREMAN_DAEMON_PROCESS").as_deref() == Ok("1") {
        let config_path =
            std::env::var("FOREMAN_CONFIG").unwrap_or_else(|_| "foreman.toml".to_string());
        let config = ForemanConfig::load_from(&config_path)?;
        init_tracing(&config, true)?;
        return daemon::run_daemon_process(config).await;
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => {
            let config = ForemanConfig::load_from(&cli.config)?;
            init_tracing(&config, false)?;
            run_foreground(config).await
        }
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { force } => daemon::start(&cli.config, force),
            DaemonCommands::Stop => daemon::stop(),
            DaemonCommands::Restart => {
                daemon::stop()?;
                daemon::start(&cli.config, true)
            }
            DaemonCommands::Status => daemon::status(),
        },
    }
}

fn init_tracing(config: &ForemanConfig, file_only: bool) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_dir = PathBuf::from(&config.daemon.state_dir).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "foreman.log");

    if file_only {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

pub(crate) async fn run_foreground(config: ForemanConfig) -> Result<()> {
    let daemon = Arc::new(Foreman::build(config).await?);
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let handles = daemon.spawn_loops(&shutdown_tx);
    info!("foreman running ({} loops)", handles.len());

    wait_for_terminate().await?;
    info!("termination signal received");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("a loop did not drain in time");
        }
    }
    daemon.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_terminate() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_terminate() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
