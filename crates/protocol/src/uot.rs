//! UDP-over-TCP (v2) framing
//!
//! A tunnel is a regular proxied stream to [`UOT_MAGIC_ADDRESS`]. The first
//! bytes are a request header, followed by length-prefixed datagrams:
//!
//! ```text
//! request:        [is_connect u8][SocksAddr destination]
//! connect mode:   [len u16 BE][payload]
//! address mode:   [SocksAddr][len u16 BE][payload]
//! ```

use crate::{AddressError, SocksAddr};
use bytes::BufMut;
use thiserror::Error;

/// Magic destination a tunnel stream is opened to
pub const UOT_MAGIC_ADDRESS: &str = "sp.v2.udp-over-tcp.arpa";

/// Largest datagram the 16-bit length prefix can carry
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramingError {
    #[error("Datagram too large: {size} bytes (max: {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl From<FramingError> for std::io::Error {
    fn from(e: FramingError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    }
}

/// Destination of the tunnel stream itself
pub fn uot_magic_destination() -> SocksAddr {
    SocksAddr::Domain(UOT_MAGIC_ADDRESS.to_string(), 0)
}

/// Tunnel request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UotRequest {
    /// Connect mode: every datagram goes to `destination`, no per-packet address
    pub is_connect: bool,
    pub destination: SocksAddr,
}

impl UotRequest {
    pub fn encode(&self) -> Result<Vec<u8>, AddressError> {
        let mut buf = Vec::with_capacity(1 + self.destination.serialized_len());
        buf.put_u8(self.is_connect as u8);
        self.destination.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Encode one datagram. `target` is written only in address mode.
pub fn encode_datagram(
    target: Option<&SocksAddr>,
    payload: &[u8],
) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(FramingError::DatagramTooLarge {
            size: payload.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }

    let addr_len = target.map(SocksAddr::serialized_len).unwrap_or(0);
    let mut buf = Vec::with_capacity(addr_len + 2 + payload.len());
    if let Some(target) = target {
        target.write_to(&mut buf)?;
    }
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf)
}
