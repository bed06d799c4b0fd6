//! Transport errors

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Dial canceled")]
    Canceled,

    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("Client is closed")]
    Closed,

    #[error("Multiplex session error: {0}")]
    Multiplex(String),
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => e,
            TransportError::Canceled => io::Error::new(io::ErrorKind::Interrupted, e),
            TransportError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, e),
            TransportError::Closed => io::Error::new(io::ErrorKind::NotConnected, e),
            TransportError::Multiplex(_) => io::Error::new(io::ErrorKind::ConnectionAborted, e),
        }
    }
}

impl From<yamux::ConnectionError> for TransportError {
    fn from(e: yamux::ConnectionError) -> Self {
        TransportError::Multiplex(e.to_string())
    }
}
