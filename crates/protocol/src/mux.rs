//! Multiplex session preface and per-stream request framing

use crate::{AddressError, Network, SocksAddr};
use bytes::BufMut;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Magic destination a multiplex session stream is opened to
pub const MUX_MAGIC_ADDRESS: &str = "sp.mux.sing-box.arpa";
pub const MUX_MAGIC_PORT: u16 = 444;

pub const MUX_VERSION: u8 = 0;

/// Stream request flags
pub const FLAG_UDP: u16 = 0x01;
pub const FLAG_ADDR: u16 = 0x02;

/// Stream response status
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxProtocolError {
    #[error("unsupported multiplex protocol: {0}")]
    Unsupported(String),
}

pub fn mux_magic_destination() -> SocksAddr {
    SocksAddr::Domain(MUX_MAGIC_ADDRESS.to_string(), MUX_MAGIC_PORT)
}

/// Stream multiplexer spoken inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxProtocol {
    #[default]
    Yamux,
}

impl MuxProtocol {
    pub const fn wire_id(&self) -> u8 {
        match self {
            Self::Yamux => 0x01,
        }
    }
}

impl FromStr for MuxProtocol {
    type Err = MuxProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "yamux" => Ok(Self::Yamux),
            other => Err(MuxProtocolError::Unsupported(other.to_string())),
        }
    }
}

impl fmt::Display for MuxProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yamux => f.write_str("yamux"),
        }
    }
}

/// First bytes written on a fresh session stream: `[version][protocol]`
pub fn encode_session_preface(protocol: MuxProtocol) -> [u8; 2] {
    [MUX_VERSION, protocol.wire_id()]
}

/// Header opening each logical stream: `[flags u16 BE][SocksAddr]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub network: Network,
    pub destination: SocksAddr,
    /// Datagrams carry their own address (listen mode)
    pub packet_addr: bool,
}

impl StreamRequest {
    pub fn stream(destination: SocksAddr) -> Self {
        Self {
            network: Network::Tcp,
            destination,
            packet_addr: false,
        }
    }

    pub fn datagram(destination: SocksAddr, packet_addr: bool) -> Self {
        Self {
            network: Network::Udp,
            destination,
            packet_addr,
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.network == Network::Udp {
            flags |= FLAG_UDP;
            if self.packet_addr {
                flags |= FLAG_ADDR;
            }
        }
        flags
    }

    pub fn encode(&self) -> Result<Vec<u8>, AddressError> {
        let mut buf = Vec::with_capacity(2 + self.destination.serialized_len());
        buf.put_u16(self.flags());
        self.destination.write_to(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("yamux".parse::<MuxProtocol>().unwrap(), MuxProtocol::Yamux);
        assert_eq!("".parse::<MuxProtocol>().unwrap(), MuxProtocol::Yamux);
        assert_eq!(
            "h2mux".parse::<MuxProtocol>(),
            Err(MuxProtocolError::Unsupported("h2mux".to_string()))
        );
    }

    #[test]
    fn test_preface() {
        assert_eq!(encode_session_preface(MuxProtocol::Yamux), [0, 1]);
    }

    #[test]
    fn test_stream_request_flags() {
        let dest: SocksAddr = "example.com:443".parse().unwrap();

        assert_eq!(StreamRequest::stream(dest.clone()).flags(), 0);
        assert_eq!(StreamRequest::datagram(dest.clone(), false).flags(), FLAG_UDP);
        assert_eq!(
            StreamRequest::datagram(dest.clone(), true).flags(),
            FLAG_UDP | FLAG_ADDR
        );

        let encoded = StreamRequest::datagram(dest.clone(), true).encode().unwrap();
        assert_eq!(&encoded[..2], &[0x00, 0x03]);
        assert_eq!(&encoded[2..], &dest.to_bytes().unwrap()[..]);
    }
}
