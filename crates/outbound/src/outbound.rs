//! Badsocks outbound adapter

use crate::relay::{copy_packets, copy_stream};
use crate::{BadsocksOutboundOptions, InboundContext, OutboundError, RawDialer};
use async_trait::async_trait;
use badsocks_crypto::{CipherMethod, ShadowsocksMethod};
use badsocks_protocol::{BoxedBoundPacketConn, BoxedPacketConn, BoxedStream, Network, SocksAddr};
use badsocks_transport::{DefaultDialer, DialContext, Dialer, MuxClient, ProxyDialer, UotClient};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

pub const OUTBOUND_TYPE: &str = "badsocks";

/// Connection returned by [`Outbound::dial`]
pub enum OutboundConn {
    Stream(BoxedStream),
    Packet(BoxedBoundPacketConn),
}

/// Outbound adapter contract
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    fn outbound_type(&self) -> &'static str;

    /// Networks this outbound can dial
    fn networks(&self) -> &[Network];

    /// Dial `destination` over `network` (`tcp`, `udp` and their 4/6 variants)
    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        destination: &SocksAddr,
    ) -> Result<OutboundConn, OutboundError>;

    /// Datagram channel that can reach any peer
    async fn listen_packet(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, OutboundError>;

    /// Relay an accepted stream to `metadata.destination`
    async fn new_connection(
        &self,
        ctx: &DialContext,
        conn: BoxedStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError>;

    /// Relay an accepted datagram channel
    async fn new_packet_connection(
        &self,
        ctx: &DialContext,
        conn: BoxedPacketConn,
        metadata: InboundContext,
    ) -> Result<(), OutboundError>;

    /// The host's network interfaces changed
    fn interface_updated(&self) -> Result<(), OutboundError>;

    fn close(&self) -> Result<(), OutboundError>;
}

/// How connections reach the server. Chosen once at construction from the
/// multiplex options alone.
pub enum DialStrategy {
    /// Everything is carried by the multiplexing client
    Multiplexed(MuxClient),
    /// Streams go straight through, datagrams are tunneled over a stream
    Tunneled(UotClient),
}

impl DialStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Multiplexed(_) => "multiplex",
            Self::Tunneled(_) => "udp-over-tcp",
        }
    }
}

pub struct BadsocksOutbound {
    tag: String,
    networks: [Network; 2],
    raw: Arc<RawDialer>,
    strategy: DialStrategy,
}

impl BadsocksOutbound {
    /// Build the outbound with the shadowsocks method and the system dialer
    pub fn new(options: &BadsocksOutboundOptions) -> Result<Self, OutboundError> {
        let server = options.server_addr()?;
        let method = ShadowsocksMethod::new(&options.method, &options.password, &server)?;
        let dialer = DefaultDialer::new(options.dialer.clone());
        Self::with_components(options, Arc::new(dialer), Arc::new(method))
    }

    /// Build the outbound around the given dialer and cipher method
    pub fn with_components(
        options: &BadsocksOutboundOptions,
        dialer: Arc<dyn Dialer>,
        method: Arc<dyn CipherMethod>,
    ) -> Result<Self, OutboundError> {
        let server = options.server_addr()?;
        let raw = Arc::new(RawDialer::new(dialer, method, server));

        let mux = match options.multiplex_enabled() {
            Some(mux_options) => MuxClient::new(raw.clone(), mux_options)?,
            None => None,
        };
        let strategy = match mux {
            Some(client) => DialStrategy::Multiplexed(client),
            None => DialStrategy::Tunneled(UotClient::new(raw.clone())),
        };

        info!(
            "Outbound {} to {} ({}, {})",
            options.tag,
            raw.server(),
            raw.method().name(),
            strategy.name()
        );

        Ok(Self {
            tag: options.tag.clone(),
            networks: [Network::Tcp, Network::Udp],
            raw,
            strategy,
        })
    }

    pub fn strategy(&self) -> &DialStrategy {
        &self.strategy
    }

    pub fn server(&self) -> &SocksAddr {
        self.raw.server()
    }

    pub async fn dial_stream(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedStream, OutboundError> {
        let span = info_span!("outbound", tag = %self.tag, destination = %destination);
        async {
            let stream = match &self.strategy {
                DialStrategy::Multiplexed(mux) => {
                    info!("outbound multiplex connection to {}", destination);
                    mux.dial_stream(ctx, destination).await?
                }
                DialStrategy::Tunneled(_) => {
                    info!("outbound connection to {}", destination);
                    self.raw.dial_stream(ctx, destination).await?
                }
            };
            Ok::<_, OutboundError>(stream)
        }
        .instrument(span)
        .await
    }

    pub async fn dial_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedBoundPacketConn, OutboundError> {
        let span = info_span!("outbound", tag = %self.tag, destination = %destination);
        async {
            let conn = match &self.strategy {
                DialStrategy::Multiplexed(mux) => {
                    info!("outbound multiplex packet connection to {}", destination);
                    mux.dial_datagram(ctx, destination).await?
                }
                DialStrategy::Tunneled(uot) => {
                    info!("outbound connect packet connection to {}", destination);
                    uot.dial_datagram(ctx, destination).await?
                }
            };
            Ok::<_, OutboundError>(conn)
        }
        .instrument(span)
        .await
    }

    pub async fn listen_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, OutboundError> {
        let span = info_span!("outbound", tag = %self.tag, destination = %destination);
        async {
            let conn = match &self.strategy {
                DialStrategy::Multiplexed(mux) => {
                    info!("outbound multiplex packet connection to {}", destination);
                    mux.listen_datagram(ctx, destination).await?
                }
                DialStrategy::Tunneled(uot) => {
                    info!("outbound packet connection to {}", destination);
                    uot.listen_datagram(ctx, destination).await?
                }
            };
            Ok::<_, OutboundError>(conn)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Outbound for BadsocksOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &'static str {
        OUTBOUND_TYPE
    }

    fn networks(&self) -> &[Network] {
        &self.networks
    }

    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        destination: &SocksAddr,
    ) -> Result<OutboundConn, OutboundError> {
        match network.parse::<Network>()? {
            Network::Tcp => Ok(OutboundConn::Stream(
                self.dial_stream(ctx, destination).await?,
            )),
            Network::Udp => Ok(OutboundConn::Packet(
                self.dial_datagram(ctx, destination).await?,
            )),
        }
    }

    async fn listen_packet(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, OutboundError> {
        self.listen_datagram(ctx, destination).await
    }

    async fn new_connection(
        &self,
        ctx: &DialContext,
        conn: BoxedStream,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let remote = self.dial_stream(ctx, &metadata.destination).await?;
        let (up, down) = copy_stream(ctx, conn, remote).await?;
        info!(
            "[{}] connection to {} closed ({} bytes up, {} bytes down)",
            metadata.inbound, metadata.destination, up, down
        );
        Ok(())
    }

    async fn new_packet_connection(
        &self,
        ctx: &DialContext,
        conn: BoxedPacketConn,
        metadata: InboundContext,
    ) -> Result<(), OutboundError> {
        let remote = self.listen_datagram(ctx, &metadata.destination).await?;
        copy_packets(ctx, conn.as_ref(), remote.as_ref()).await?;
        info!(
            "[{}] packet connection to {} closed",
            metadata.inbound, metadata.destination
        );
        Ok(())
    }

    fn interface_updated(&self) -> Result<(), OutboundError> {
        if let DialStrategy::Multiplexed(mux) = &self.strategy {
            mux.reset();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), OutboundError> {
        if let DialStrategy::Multiplexed(mux) = &self.strategy {
            mux.close();
        }
        Ok(())
    }
}
