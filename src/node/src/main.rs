//! A2A Key Exchange Daemon - Main Binary
//!
//! Runs a key exchange engine with:
//! - Per-agent X25519/Ed25519 key pairs
//! - Scheduled and emergency rotation
//! - Threshold escrow of shared secrets
//! - Prometheus counters printed on shutdown

use a2a_keyd::{KeyDaemon, NodeConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

/// A2A key exchange daemon CLI
#[derive(Parser)]
#[command(name = "a2a-keyd")]
#[command(about = "Agent-to-agent key exchange daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short, long, env = "A2A_KEYD_CONFIG")]
    config: Option<PathBuf>,

    /// Agents to provision at startup (adds to the config file)
    #[arg(long = "agent", env = "A2A_KEYD_AGENTS", value_delimiter = ',')]
    agents: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and rotation scheduler until Ctrl+C (default)
    Run,

    /// Exchange, rotate and escrow between two demo agents
    Demo,

    /// Split a hex secret into threshold shares sealed under [vault].share_key (JSON on stdout)
    Split {
        /// Secret as hex
        #[arg(long)]
        secret: String,

        #[arg(short, long)]
        threshold: usize,

        #[arg(short = 'n', long)]
        total: usize,
    },

    /// Recombine shares from a JSON file and print the hex secret
    Combine {
        /// File written by `split` (any subset of at least threshold shares)
        #[arg(short, long)]
        shares: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},a2a_exchange=debug", log_level).into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let config = NodeConfig::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => NodeConfig::default(),
    };
    config.node.agents.extend(cli.agents);

    let daemon = KeyDaemon::new(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Starting a2a-keyd v{}", env!("CARGO_PKG_VERSION"));
            daemon.run(shutdown_signal()).await?;
            print_metrics(&daemon);
            info!("Daemon stopped gracefully");
        }
        Command::Demo => {
            let report = daemon.demo().await?;
            println!("exchange      {} <-> {}", report.initiator, report.responder);
            println!("secret hash   {}", report.secret_hash);
            println!("after rotate  {}", report.rotated_secret_hash);
            println!(
                "escrow        {}-of-{} recovered: {}",
                report.escrow_threshold, report.escrow_total, report.escrow_recovered
            );
            daemon.shutdown().await;
            print_metrics(&daemon);
        }
        Command::Split { secret, threshold, total } => {
            println!("{}", daemon.split(&secret, threshold, total)?);
        }
        Command::Combine { shares } => {
            let json = std::fs::read_to_string(&shares)
                .with_context(|| format!("Failed to read shares from {:?}", shares))?;
            println!("{}", daemon.combine(&json)?);
        }
    }

    Ok(())
}

fn print_metrics(daemon: &KeyDaemon) {
    match daemon.engine().encode_metrics() {
        Ok(text) => eprint!("{}", text),
        Err(e) => warn!("Failed to encode metrics: {}", e),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received shutdown signal (Ctrl+C)"),
        _ = terminate() => info!("Received shutdown signal (SIGTERM)"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-Unix systems, only Ctrl+C is supported
    std::future::pending::<()>().await
}
