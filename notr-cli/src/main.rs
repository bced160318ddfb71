//! notrd
//!
//! Command-line entry point for the notr tunnel broker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notr_engine::{Broker, Config};

/// notrd - VPN tunnel broker with transparent TCP/UDP forwarding
#[derive(Parser)]
#[command(name = "notrd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "notrd.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Server,

    /// Validate the configuration file and print a summary
    Check,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "notrd.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Server => run_server(&cli.config).await,
        Commands::Check => check_config(&cli.config),
        Commands::GenConfig { output } => generate_config(&output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // The engine logs through `log`; tracing-log bridges those records here
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config_path: &Path) -> Result<()> {
    info!("Starting notr broker...");

    let config = load_config(config_path)?;
    let mut broker = Broker::new(config).context("Failed to create broker")?;

    info!("Configuration loaded from {:?}", config_path);

    let shutdown_tx = broker.create_shutdown_handle();
    let mut broker_handle = tokio::spawn(async move { broker.run().await });

    tokio::select! {
        finished = &mut broker_handle => {
            // Stopped on its own: startup failed or a component died
            return match finished {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Broker error: {}", e);
                    Err(e).context("Broker stopped")
                }
                Err(e) => Err(e).context("Broker task failed"),
            };
        }
        signal = wait_for_shutdown() => signal?,
    }

    info!("Shutting down broker...");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(Duration::from_secs(5), broker_handle).await {
        Ok(Ok(Err(e))) => error!("Broker error during shutdown: {}", e),
        Err(_) => error!("Broker did not stop within 5s"),
        _ => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let network = config.gateway.network()?;

    println!("Configuration {:?} is valid", path);
    println!("  control listener: {}", config.server.listen);
    println!("  overlay network:  {}", network);
    match &config.tcp_forward {
        Some(tcp) => println!("  tcp forwarder:    {}", tcp.listen),
        None => println!("  tcp forwarder:    disabled"),
    }
    match &config.udp_forward {
        Some(udp) => println!(
            "  udp forwarder:    {} (idle timeout {}s)",
            udp.listen, udp.session_timeout
        ),
        None => println!("  udp forwarder:    disabled"),
    }

    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the configuration file and set your auth key before running.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
