//! badsocks Client
//!
//! Local SOCKS5 proxy forwarding through a badsocks outbound.

use anyhow::Result;
use badsocks_client::config::ClientConfig;
use badsocks_client::socks5;
use badsocks_outbound::{BadsocksOutbound, Outbound};
use badsocks_transport::DialContext;
use clap::Parser;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// badsocks Client - SOCKS5 proxy over a badsocks server
#[derive(Parser, Debug)]
#[command(name = "badsocks")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ClientConfig::load(&args.config).await?;

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config.log.level.parse().unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("badsocks client v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {}", args.config);

    let outbound: Arc<dyn Outbound> = Arc::new(BadsocksOutbound::new(&config.outbound)?);
    let ctx = DialContext::new();

    #[cfg(unix)]
    let interface_watcher = tokio::spawn(watch_interface_changes(outbound.clone()));

    info!("Starting SOCKS5 proxy on {}", config.socks5.bind);
    tokio::select! {
        result = socks5::run(config.socks5.bind, outbound.clone(), ctx.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Cleanup
    ctx.cancel();
    #[cfg(unix)]
    interface_watcher.abort();
    if let Err(e) = outbound.close() {
        warn!("Failed to close outbound: {}", e);
    }

    Ok(())
}

/// SIGHUP signals a network interface change
#[cfg(unix)]
async fn watch_interface_changes(outbound: Arc<dyn Outbound>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        info!("Network interfaces changed, resetting {}", outbound.tag());
        outbound.interface_updated()?;
    }
    Ok(())
}
