//! UDP-over-TCP tunnel client

use crate::{BoundStreamPacketConn, DialContext, ProxyDialer, StreamPacketConn, TransportError};
use badsocks_protocol::{
    uot_magic_destination, BoxedBoundPacketConn, BoxedPacketConn, BoxedStream, SocksAddr,
    UotRequest,
};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Carries datagrams over a single proxied stream to the UoT magic address
#[derive(Clone)]
pub struct UotClient {
    dialer: Arc<dyn ProxyDialer>,
}

impl UotClient {
    pub fn new(dialer: Arc<dyn ProxyDialer>) -> Self {
        Self { dialer }
    }

    /// Connect-mode tunnel: all datagrams go to `destination`
    pub async fn dial_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedBoundPacketConn, TransportError> {
        let stream = self.open(ctx, destination, true).await?;
        Ok(Box::new(BoundStreamPacketConn::new(
            stream,
            destination.clone(),
        )))
    }

    /// Address-mode tunnel: each datagram carries its own target
    pub async fn listen_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, TransportError> {
        let stream = self.open(ctx, destination, false).await?;
        Ok(Box::new(StreamPacketConn::new(stream)))
    }

    async fn open(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
        is_connect: bool,
    ) -> Result<BoxedStream, TransportError> {
        let request = UotRequest {
            is_connect,
            destination: destination.clone(),
        }
        .encode()
        .map_err(io::Error::from)?;

        let mut stream = self
            .dialer
            .dial_stream(ctx, &uot_magic_destination())
            .await?;

        ctx.run(async {
            stream.write_all(&request).await?;
            stream.flush().await
        })
        .await?;

        debug!(
            "Opened UDP-over-TCP tunnel to {} (connect: {})",
            destination, is_connect
        );
        Ok(stream)
    }
}
