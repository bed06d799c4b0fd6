//! Metadata of connections handed to an outbound

use badsocks_protocol::SocksAddr;
use std::net::SocketAddr;

/// Where an accepted connection came from and where it wants to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundContext {
    /// Tag of the inbound that accepted the connection
    pub inbound: String,
    pub source: Option<SocketAddr>,
    pub destination: SocksAddr,
}

impl InboundContext {
    pub fn new(inbound: impl Into<String>, destination: SocksAddr) -> Self {
        Self {
            inbound: inbound.into(),
            source: None,
            destination,
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }
}
