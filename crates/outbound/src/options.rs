//! Outbound configuration

use crate::OutboundError;
use badsocks_crypto::DEFAULT_METHOD;
use badsocks_protocol::SocksAddr;
use badsocks_transport::{DialerOptions, MultiplexOptions};
use serde::Deserialize;

/// Badsocks outbound configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BadsocksOutboundOptions {
    /// Outbound tag used in logs
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Server host name or IP
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub server_port: u16,

    /// Cipher method
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub multiplex: Option<MultiplexOptions>,

    /// Socket options
    #[serde(flatten)]
    pub dialer: DialerOptions,
}

fn default_tag() -> String {
    "badsocks".to_string()
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

impl Default for BadsocksOutboundOptions {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            server: String::new(),
            server_port: 0,
            method: default_method(),
            password: String::new(),
            multiplex: None,
            dialer: DialerOptions::default(),
        }
    }
}

impl BadsocksOutboundOptions {
    /// Server address from `server` and `server_port`
    pub fn server_addr(&self) -> Result<SocksAddr, OutboundError> {
        if self.server.is_empty() {
            return Err(OutboundError::Config("server is required".to_string()));
        }
        if self.server_port == 0 {
            return Err(OutboundError::Config("server_port is required".to_string()));
        }
        SocksAddr::new(&self.server, self.server_port)
            .map_err(|e| OutboundError::Config(format!("server: {}", e)))
    }

    /// Multiplex options, `None` when absent or disabled
    pub fn multiplex_enabled(&self) -> Option<&MultiplexOptions> {
        self.multiplex.as_ref().filter(|options| options.enabled)
    }
}
