//! Shadowsocks-backed cipher method

use crate::{CipherMethod, MethodError};
use async_trait::async_trait;
use badsocks_protocol::{BoxedPacketConn, BoxedStream, PacketConn, SocksAddr};
use shadowsocks::ServerAddr;
use shadowsocks::config::{ServerConfig, ServerType};
use shadowsocks::context::{Context, SharedContext};
use shadowsocks::crypto::CipherKind;
use shadowsocks::net::UdpSocket as SsUdpSocket;
use shadowsocks::relay::socks5::Address;
use shadowsocks::relay::tcprelay::ProxyClientStream;
use shadowsocks::relay::udprelay::proxy_socket::{ProxySocket, UdpSocketType};
use std::fmt;
use std::io;
use tokio::net::UdpSocket;
use tracing::debug;

/// Default method when none is configured
pub const DEFAULT_METHOD: &str = "aes-256-gcm";

/// AEAD cipher method
pub struct ShadowsocksMethod {
    name: String,
    context: SharedContext,
    config: ServerConfig,
}

impl ShadowsocksMethod {
    /// Build a method from its name and password.
    ///
    /// `server` is recorded in the underlying server config; wrapping never
    /// dials it.
    pub fn new(method: &str, password: &str, server: &SocksAddr) -> Result<Self, MethodError> {
        let kind: CipherKind = method
            .parse()
            .map_err(|_| MethodError::UnknownMethod(method.to_string()))?;

        if password.is_empty() && kind != CipherKind::NONE {
            return Err(MethodError::EmptyPassword(method.to_string()));
        }

        let server_addr = match server {
            SocksAddr::Ip(addr) => ServerAddr::SocketAddr(*addr),
            SocksAddr::Domain(domain, port) => ServerAddr::DomainName(domain.clone(), *port),
        };

        let config = ServerConfig::new(server_addr, password.to_string(), kind).map_err(|e| {
            MethodError::InvalidPassword {
                method: method.to_string(),
                reason: e.to_string(),
            }
        })?;

        debug!("Created cipher method {} for {}", method, server);

        Ok(Self {
            name: method.to_string(),
            context: Context::new_shared(ServerType::Local),
            config,
        })
    }
}

impl CipherMethod for ShadowsocksMethod {
    fn name(&self) -> &str {
        &self.name
    }

    fn dial_early_conn(&self, conn: BoxedStream, destination: &SocksAddr) -> BoxedStream {
        let stream = ProxyClientStream::from_stream(
            self.context.clone(),
            conn,
            &self.config,
            to_ss_address(destination),
        );
        Box::new(stream)
    }

    fn dial_packet_conn(&self, socket: UdpSocket) -> BoxedPacketConn {
        let socket = ProxySocket::from_socket(
            UdpSocketType::Client,
            self.context.clone(),
            &self.config,
            SsUdpSocket::from(socket),
        );
        Box::new(ShadowsocksPacketConn { socket })
    }
}

impl fmt::Debug for ShadowsocksMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowsocksMethod")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Encrypted datagram channel to the proxy server
pub struct ShadowsocksPacketConn {
    socket: ProxySocket<SsUdpSocket>,
}

#[async_trait]
impl PacketConn for ShadowsocksPacketConn {
    async fn send_to(&self, payload: &[u8], target: &SocksAddr) -> io::Result<usize> {
        self.socket
            .send(&to_ss_address(target), payload)
            .await
            .map_err(io::Error::other)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)> {
        let (n, addr, _raw_len) = self.socket.recv(buf).await.map_err(io::Error::other)?;
        Ok((n, from_ss_address(addr)))
    }
}

fn to_ss_address(addr: &SocksAddr) -> Address {
    match addr {
        SocksAddr::Ip(addr) => Address::SocketAddress(*addr),
        SocksAddr::Domain(domain, port) => Address::DomainNameAddress(domain.clone(), *port),
    }
}

fn from_ss_address(addr: Address) -> SocksAddr {
    match addr {
        Address::SocketAddress(addr) => SocksAddr::Ip(addr),
        Address::DomainNameAddress(domain, port) => SocksAddr::Domain(domain, port),
    }
}
