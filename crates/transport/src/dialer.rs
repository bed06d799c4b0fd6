//! Socket dialing
//!
//! [`Dialer`] opens raw sockets to a host; [`ProxyDialer`] is the proxied
//! capability built on top of it (raw socket wrapped by the cipher method),
//! consumed by the UDP-over-TCP and multiplexing clients.

use crate::{DialContext, TransportError};
use async_trait::async_trait;
use badsocks_protocol::{BoxedBoundPacketConn, BoxedPacketConn, BoxedStream, SocksAddr};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Opens raw connections to a host
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connected byte stream to `destination`
    async fn dial_stream(&self, destination: &SocksAddr) -> io::Result<BoxedStream>;

    /// UDP socket connected to `destination`
    async fn dial_datagram(&self, destination: &SocksAddr) -> io::Result<UdpSocket>;
}

/// Proxied dial capability: every connection is opened to the proxy server and
/// carries `destination` through the cipher method.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial_stream(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedStream, TransportError>;

    /// Datagram channel bound to `destination`
    async fn dial_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedBoundPacketConn, TransportError>;

    /// Unbound datagram channel; `destination` is only the initial peer
    async fn listen_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, TransportError>;
}

/// Socket options for outgoing connections
#[derive(Debug, Clone, Deserialize)]
pub struct DialerOptions {
    /// Bind sockets to this interface (`SO_BINDTODEVICE`, Linux only)
    #[serde(default)]
    pub bind_interface: Option<String>,

    /// Routing mark (`SO_MARK`, Linux only)
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// Per-address connect timeout in seconds, 0 disables
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// TCP keepalive idle time in seconds, 0 disables
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_tcp_keepalive() -> u64 {
    30
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            bind_interface: None,
            routing_mark: None,
            connect_timeout: default_connect_timeout(),
            tcp_keepalive: default_tcp_keepalive(),
        }
    }
}

/// Dialer backed by the operating system's sockets
#[derive(Debug, Clone, Default)]
pub struct DefaultDialer {
    options: DialerOptions,
}

impl DefaultDialer {
    pub fn new(options: DialerOptions) -> Self {
        if !cfg!(any(target_os = "linux", target_os = "android")) {
            if options.bind_interface.is_some() {
                warn!("bind_interface is only supported on Linux, ignoring");
            }
            if options.routing_mark.is_some() {
                warn!("routing_mark is only supported on Linux, ignoring");
            }
        }
        Self { options }
    }

    async fn resolve(destination: &SocksAddr) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match destination {
            SocksAddr::Ip(addr) => vec![*addr],
            SocksAddr::Domain(host, port) => {
                tokio::net::lookup_host((host.as_str(), *port)).await?.collect()
            }
        };

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No addresses found for {}", destination),
            ));
        }
        Ok(addrs)
    }

    fn new_socket(&self, addr: &SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;
        socket.set_nonblocking(true)?;
        self.apply_routing(&socket)?;
        Ok(socket)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn apply_routing(&self, socket: &Socket) -> io::Result<()> {
        if let Some(interface) = &self.options.bind_interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        if let Some(mark) = self.options.routing_mark {
            socket.set_mark(mark)?;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn apply_routing(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = self.new_socket(&addr, Type::STREAM, Protocol::TCP)?;
        if self.options.tcp_keepalive > 0 {
            let keepalive =
                TcpKeepalive::new().with_time(Duration::from_secs(self.options.tcp_keepalive));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = if self.options.connect_timeout > 0 {
            let limit = Duration::from_secs(self.options.connect_timeout);
            tokio::time::timeout(limit, socket.connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("Connect to {} timed out", addr),
                    )
                })??
        } else {
            socket.connect(addr).await?
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn bind_udp(&self, peer: &SocketAddr) -> io::Result<UdpSocket> {
        let socket = self.new_socket(peer, Type::DGRAM, Protocol::UDP)?;
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket.bind(&local.into())?;
        UdpSocket::from_std(socket.into())
    }
}

#[async_trait]
impl Dialer for DefaultDialer {
    async fn dial_stream(&self, destination: &SocksAddr) -> io::Result<BoxedStream> {
        let mut last_err = None;
        for addr in Self::resolve(destination).await? {
            match self.connect_tcp(addr).await {
                Ok(stream) => {
                    debug!("Connected to {} ({})", destination, addr);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!("Connect to {} ({}) failed: {}", destination, addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::other("No addresses to connect to")))
    }

    async fn dial_datagram(&self, destination: &SocksAddr) -> io::Result<UdpSocket> {
        let mut last_err = None;
        for addr in Self::resolve(destination).await? {
            let attempt = async {
                let socket = self.bind_udp(&addr)?;
                socket.connect(addr).await?;
                Ok::<_, io::Error>(socket)
            };
            match attempt.await {
                Ok(socket) => {
                    debug!("UDP socket connected to {} ({})", destination, addr);
                    return Ok(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::other("No addresses to connect to")))
    }
}
