use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

mod client;
mod config;
mod device;
mod hub;
mod metrics;
mod scheduler;
mod sim;

use crate::config::VerdantConfig;
use crate::device::DeviceType;

#[derive(Parser)]
#[command(name = "verdant")]
#[command(about = "Presence hub and scene resolver for a sensor-driven installation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging (unless RUST_LOG is set)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub: WebSocket server for devices and consumers
    Hub {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Follow a hub and log composite scene changes
    Listen {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
    },
    /// Simulate sensor devices against a hub
    Simulate {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Device types to simulate, comma-separated (default: all)
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,
        /// Milliseconds between readings
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
        /// Drop and reconnect each device after this many seconds
        #[arg(long)]
        flap_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "verdant=debug,tower_http=debug"
    } else {
        "verdant=info,tower_http=warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = VerdantConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Hub { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            info!("starting hub");
            hub::server::run(config).await
        }
        Commands::Listen { url } => {
            info!("starting listener");
            client::listen::run(url, config).await
        }
        Commands::Simulate {
            url,
            devices,
            interval_ms,
            flap_secs,
        } => {
            let devices = if devices.is_empty() {
                DeviceType::ALL.to_vec()
            } else {
                let mut resolved = Vec::new();
                for name in &devices {
                    match DeviceType::from_name(name) {
                        Some(device) => resolved.push(device),
                        None => bail!("unknown device type '{name}'"),
                    }
                }
                resolved
            };
            info!(count = devices.len(), "starting simulator");
            sim::run(sim::SimOptions {
                url,
                devices,
                interval: Duration::from_millis(interval_ms),
                flap_after: flap_secs.map(Duration::from_secs),
            })
            .await
        }
    }
}
