//! Connection contracts shared by dialers, cipher methods and outbounds

use crate::SocksAddr;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Datagram channel that can reach arbitrary peers
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send one datagram to `target`
    async fn send_to(&self, payload: &[u8], target: &SocksAddr) -> io::Result<usize>;

    /// Receive one datagram and the peer it came from
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)>;
}

pub type BoxedPacketConn = Box<dyn PacketConn>;

/// Datagram channel bound to a single peer
#[async_trait]
pub trait BoundPacketConn: Send + Sync {
    fn peer(&self) -> &SocksAddr;

    async fn send(&self, payload: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

pub type BoxedBoundPacketConn = Box<dyn BoundPacketConn>;

/// Binds an unbound `PacketConn` to one destination so callers of a single
/// flow do not repeat the address on every send.
pub struct BindPacketConn<P> {
    inner: P,
    peer: SocksAddr,
}

impl<P: PacketConn> BindPacketConn<P> {
    pub fn new(inner: P, peer: SocksAddr) -> Self {
        Self { inner, peer }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

#[async_trait]
impl<P: PacketConn> BoundPacketConn for BindPacketConn<P> {
    fn peer(&self) -> &SocksAddr {
        &self.peer
    }

    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.inner.send_to(payload, &self.peer).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _from) = self.inner.recv_from(buf).await?;
        Ok(n)
    }
}

#[async_trait]
impl<P: PacketConn + ?Sized> PacketConn for Box<P> {
    async fn send_to(&self, payload: &[u8], target: &SocksAddr) -> io::Result<usize> {
        (**self).send_to(payload, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)> {
        (**self).recv_from(buf).await
    }
}
