use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use minidhcp::{Config, DhcpServer, Leases, Result, storage};

#[derive(Parser)]
#[command(name = "minidhcp")]
#[command(author, version, about = "A small DHCP server for a single LAN", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (default).
    Run,
    /// Print the effective configuration.
    ShowConfig,
    /// Print every stored lease.
    ListLeases,
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!("Failed to listen for SIGTERM: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, stopping server...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Arc::new(Config::load(&cli.config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let backend = storage::open_backend(&config.storage)?;
            let leases = Arc::new(Leases::new(&config, backend).await?);
            let server = DhcpServer::new(config, leases).await?;
            server.run(shutdown_signal()).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(config.as_ref())?);
            Ok(())
        }
        Commands::ListLeases => {
            let backend = storage::open_backend(&config.storage)?;
            let store = Leases::new(&config, backend).await?;
            let leases = store.list_leases().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<18} {:<16} {:<24} {:<24}",
                    "MAC Address", "IP Address", "Hostname", "Allocated At"
                );
                println!("{}", "-".repeat(84));

                for lease in &leases {
                    println!(
                        "{:<18} {:<16} {:<24} {:<24}",
                        lease.mac_address.to_string(),
                        lease.ip_address.to_string(),
                        lease.hostname.as_deref().unwrap_or("-"),
                        lease.allocated_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
                println!(
                    "\n{} lease(s), {} free address(es)",
                    leases.len(),
                    store.free_ip_count().await
                );
            }

            Ok(())
        }
    }
}
