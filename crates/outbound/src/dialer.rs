//! Raw proxied dialer: generic dialer + cipher method + fixed server

use async_trait::async_trait;
use badsocks_crypto::CipherMethod;
use badsocks_protocol::{
    BindPacketConn, BoxedBoundPacketConn, BoxedPacketConn, BoxedStream, SocksAddr,
};
use badsocks_transport::{DialContext, Dialer, ProxyDialer, TransportError};
use std::io;
use std::sync::Arc;
use tracing::trace;

/// Opens every connection to the configured server and wraps it with the
/// cipher method. Shared by the stream path and the mux / UoT clients.
pub struct RawDialer {
    dialer: Arc<dyn Dialer>,
    method: Arc<dyn CipherMethod>,
    server: SocksAddr,
}

impl RawDialer {
    pub fn new(dialer: Arc<dyn Dialer>, method: Arc<dyn CipherMethod>, server: SocksAddr) -> Self {
        Self {
            dialer,
            method,
            server,
        }
    }

    pub fn server(&self) -> &SocksAddr {
        &self.server
    }

    pub fn method(&self) -> &dyn CipherMethod {
        self.method.as_ref()
    }
}

#[async_trait]
impl ProxyDialer for RawDialer {
    async fn dial_stream(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedStream, TransportError> {
        // The cipher header carries the destination; reject it before dialing
        destination.validate().map_err(io::Error::from)?;
        let conn = ctx.run(self.dialer.dial_stream(&self.server)).await?;
        trace!("Wrapping stream to {} for {}", self.server, destination);
        Ok(self.method.dial_early_conn(conn, destination))
    }

    async fn dial_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedBoundPacketConn, TransportError> {
        let conn = self.listen_datagram(ctx, destination).await?;
        Ok(Box::new(BindPacketConn::new(conn, destination.clone())))
    }

    async fn listen_datagram(
        &self,
        ctx: &DialContext,
        _destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, TransportError> {
        let socket = ctx.run(self.dialer.dial_datagram(&self.server)).await?;
        Ok(self.method.dial_packet_conn(socket))
    }
}
