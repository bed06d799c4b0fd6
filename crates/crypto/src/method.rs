//! Cipher method contract

use badsocks_protocol::{BoxedPacketConn, BoxedStream, SocksAddr};
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Error, Debug)]
pub enum MethodError {
    #[error("Unknown cipher method: {0}")]
    UnknownMethod(String),

    #[error("Password is required for method {0}")]
    EmptyPassword(String),

    #[error("Invalid password for method {method}: {reason}")]
    InvalidPassword { method: String, reason: String },
}

/// Obfuscation layer wrapping raw connections to the proxy server.
///
/// Implementations never perform I/O while wrapping; the destination header
/// is sent together with the first payload write.
pub trait CipherMethod: Send + Sync {
    /// Method name as configured (e.g. `aes-256-gcm`)
    fn name(&self) -> &str;

    /// Wrap a raw server stream so that the first write carries `destination`
    fn dial_early_conn(&self, conn: BoxedStream, destination: &SocksAddr) -> BoxedStream;

    /// Wrap a UDP socket connected to the server into an unbound datagram channel
    fn dial_packet_conn(&self, socket: UdpSocket) -> BoxedPacketConn;
}
