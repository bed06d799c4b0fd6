//! SOCKS5-style destination addresses

use bytes::{Buf, BufMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain the one-byte length prefix can carry
pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Unknown address type: {0:#04x}")]
    UnknownType(u8),

    #[error("Invalid domain name")]
    InvalidDomain,

    #[error("Invalid address: {0}")]
    Invalid(String),
}

impl From<AddressError> for io::Error {
    fn from(e: AddressError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Destination or server address: either a socket address or a domain name
/// that is resolved later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    /// Create a domain address, falling back to `Ip` when `host` is an IP literal
    pub fn new(host: &str, port: u16) -> Result<Self, AddressError> {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        let addr = Self::Domain(host.to_string(), port);
        addr.validate()?;
        Ok(addr)
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(domain, _) => domain.clone(),
        }
    }

    /// Length of the SOCKS5 serialization
    pub fn serialized_len(&self) -> usize {
        match self {
            Self::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Self::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Self::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Domains must be 1..=255 bytes to be serializable
    pub fn validate(&self) -> Result<(), AddressError> {
        match self {
            Self::Domain(domain, _) if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN => {
                Err(AddressError::InvalidDomain)
            }
            _ => Ok(()),
        }
    }

    /// Write the SOCKS5 serialization (ATYP, address, port BE). Nothing is
    /// written for an address that fails [`SocksAddr::validate`].
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<(), AddressError> {
        self.validate()?;
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, AddressError> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode a SOCKS5 address from an in-memory buffer
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, AddressError> {
        ensure_remaining(buf, 1)?;
        match buf.get_u8() {
            ATYP_IPV4 => {
                ensure_remaining(buf, 4 + 2)?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Self::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port)))
            }
            ATYP_IPV6 => {
                ensure_remaining(buf, 16 + 2)?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.get_u16();
                Ok(Self::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port)))
            }
            ATYP_DOMAIN => {
                ensure_remaining(buf, 1)?;
                let len = buf.get_u8() as usize;
                ensure_remaining(buf, len + 2)?;
                let mut domain = vec![0u8; len];
                buf.copy_to_slice(&mut domain);
                let port = buf.get_u16();
                let domain = String::from_utf8(domain).map_err(|_| AddressError::InvalidDomain)?;
                if domain.is_empty() {
                    return Err(AddressError::InvalidDomain);
                }
                Ok(Self::Domain(domain, port))
            }
            other => Err(AddressError::UnknownType(other)),
        }
    }

    /// Read a SOCKS5 address from an async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let atyp = reader.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port)))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port)))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let port = reader.read_u16().await?;
                let domain = String::from_utf8(domain).map_err(|_| AddressError::InvalidDomain)?;
                if domain.is_empty() {
                    return Err(AddressError::InvalidDomain.into());
                }
                Ok(Self::Domain(domain, port))
            }
            other => Err(AddressError::UnknownType(other).into()),
        }
    }
}

fn ensure_remaining<B: Buf>(buf: &B, need: usize) -> Result<(), AddressError> {
    if buf.remaining() < need {
        return Err(AddressError::Truncated {
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

impl From<SocketAddr> for SocksAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl FromStr for SocksAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Invalid(format!("missing port in {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::Invalid(format!("invalid port in {s}")))?;

        // Bare IPv6 without brackets is ambiguous
        if host.contains(':') && !host.starts_with('[') {
            return Err(AddressError::Invalid(s.to_string()));
        }

        Self::new(host, port)
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
