//! Outbound errors

use badsocks_crypto::MethodError;
use badsocks_protocol::NetworkError;
use badsocks_transport::{MuxOptionsError, TransportError};
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboundError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Dial failed: {0}")]
    Dial(#[source] io::Error),

    #[error("Dial canceled")]
    Canceled,

    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("Outbound is closed")]
    Closed,

    #[error("Relay error: {0}")]
    Relay(#[source] io::Error),
}

impl From<TransportError> for OutboundError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => OutboundError::Dial(e),
            TransportError::Canceled => OutboundError::Canceled,
            TransportError::Timeout(limit) => OutboundError::Timeout(limit),
            TransportError::Closed => OutboundError::Closed,
            TransportError::Multiplex(reason) => {
                OutboundError::Dial(io::Error::new(io::ErrorKind::ConnectionAborted, reason))
            }
        }
    }
}

impl From<NetworkError> for OutboundError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Unknown(name) => OutboundError::UnsupportedNetwork(name),
        }
    }
}

impl From<MethodError> for OutboundError {
    fn from(e: MethodError) -> Self {
        OutboundError::Config(e.to_string())
    }
}

impl From<MuxOptionsError> for OutboundError {
    fn from(e: MuxOptionsError) -> Self {
        OutboundError::Config(format!("multiplex: {}", e))
    }
}
