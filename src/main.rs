//! sfu - WebRTC selective forwarding unit
//!
//! Browsers sign in over WebSocket, publish audio and video, and receive
//! each other's streams relayed through this server.

mod config;
mod signalling;
mod webrtc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ServerConfig;
use signalling::SignallingServer;
use webrtc::certificate::Certificate;

#[derive(Parser)]
#[command(name = "sfu")]
#[command(about = "WebRTC selective forwarding unit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signalling server and media engine
    Serve {
        /// Override the signalling listen address
        #[arg(short, long)]
        listen: Option<std::net::SocketAddr>,
    },

    /// Print the DTLS certificate fingerprint
    Fingerprint,

    /// Write a config file with default values
    GenConfig {
        /// Output path (defaults to the per-user config file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve { listen } => {
            let mut config = ServerConfig::load(cli.config.as_deref())?;
            if let Some(addr) = listen {
                config.signalling_addr = addr;
            }
            if config.disable_webrtc_encryption {
                tracing::warn!("WebRTC encryption is disabled; media is sent in the clear");
            }
            let certificate =
                Certificate::from_config(&config).context("Failed to load DTLS certificate")?;
            tracing::info!("DTLS fingerprint sha-256 {}", certificate.fingerprint());

            let server = SignallingServer::new(Arc::new(config), Arc::new(certificate));
            tokio::select! {
                res = server.run() => res?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
            }
        }
        Commands::Fingerprint => {
            let config = ServerConfig::load(cli.config.as_deref())?;
            let certificate =
                Certificate::from_config(&config).context("Failed to load DTLS certificate")?;
            if config.certificate_path.is_none() {
                eprintln!("No certificate configured; this one is freshly generated");
            }
            println!("sha-256 {}", certificate.fingerprint());
        }
        Commands::GenConfig { output } => {
            let path = match output.or(cli.config) {
                Some(p) => p,
                None => ServerConfig::default_path()?,
            };
            ServerConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
