//! Client configuration

use anyhow::Result;
use badsocks_outbound::BadsocksOutboundOptions;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// SOCKS5 configuration
    #[serde(default)]
    pub socks5: Socks5Config,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Outbound to the badsocks server
    pub outbound: BadsocksOutboundOptions,
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// SOCKS5 server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    /// Bind address
    #[serde(default = "default_socks5_bind")]
    pub bind: SocketAddr,
}

fn default_socks5_bind() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 1080).into()
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            bind: default_socks5_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
