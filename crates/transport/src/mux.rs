//! Multiplexing client
//!
//! Logical streams and datagram flows are carried over a small pool of
//! sessions. Each session is one proxied stream to the multiplex magic address
//! running a yamux client.

use crate::mux_session::{MuxSession, MuxStream, StreamLease};
use crate::{BoundStreamPacketConn, DialContext, ProxyDialer, StreamPacketConn, TransportError};
use badsocks_protocol::{
    encode_session_preface, mux_magic_destination, BoxedBoundPacketConn, BoxedPacketConn,
    BoxedStream, MuxProtocol, MuxProtocolError, SocksAddr, StreamRequest,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Session count used when neither limit is configured
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxOptionsError {
    #[error(transparent)]
    Protocol(#[from] MuxProtocolError),

    #[error("max_connections and max_streams are mutually exclusive")]
    ConflictingLimits,

    #[error("min_streams ({min}) exceeds max_streams ({max})")]
    MinAboveMax { min: usize, max: usize },
}

/// Multiplex configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultiplexOptions {
    #[serde(default)]
    pub enabled: bool,

    /// Stream multiplexer, only `yamux` is supported
    #[serde(default)]
    pub protocol: String,

    /// Maximum number of sessions
    #[serde(default)]
    pub max_connections: usize,

    /// Streams a session must carry before another session is opened
    #[serde(default)]
    pub min_streams: usize,

    /// Maximum streams per session; conflicts with `max_connections`
    #[serde(default)]
    pub max_streams: usize,
}

impl MultiplexOptions {
    /// Check the options and resolve the session limits
    pub fn validate(&self) -> Result<(MuxProtocol, SessionLimits), MuxOptionsError> {
        let protocol: MuxProtocol = self.protocol.parse()?;

        if self.max_connections > 0 && self.max_streams > 0 {
            return Err(MuxOptionsError::ConflictingLimits);
        }
        if self.max_streams > 0 && self.min_streams > self.max_streams {
            return Err(MuxOptionsError::MinAboveMax {
                min: self.min_streams,
                max: self.max_streams,
            });
        }

        let max_connections = if self.max_connections == 0 && self.max_streams == 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_connections
        };

        Ok((
            protocol,
            SessionLimits {
                max_connections,
                min_streams: self.min_streams,
                max_streams: self.max_streams,
            },
        ))
    }
}

/// Resolved pool limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_connections: usize,
    pub min_streams: usize,
    pub max_streams: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Reuse the session at this index
    Reuse(usize),
    Open,
}

impl SessionLimits {
    /// Pick a session given the stream count of each live session
    pub fn select(&self, loads: &[usize]) -> Selection {
        let Some((least, &load)) = loads.iter().enumerate().min_by_key(|(_, n)| **n) else {
            return Selection::Open;
        };

        if self.max_streams > 0 {
            if load < self.max_streams {
                Selection::Reuse(least)
            } else {
                Selection::Open
            }
        } else if loads.len() < self.max_connections
            && loads.iter().all(|&n| n >= self.min_streams)
        {
            Selection::Open
        } else {
            Selection::Reuse(least)
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct MuxStats {
    pub sessions: usize,
    pub active_streams: usize,
    pub total_streams: u64,
    pub closed: bool,
}

/// Multiplexing client over a proxied dialer
pub struct MuxClient {
    dialer: Arc<dyn ProxyDialer>,
    protocol: MuxProtocol,
    limits: SessionLimits,
    sessions: Mutex<Vec<Arc<MuxSession>>>,
    /// Held while a session is being opened
    dialing: tokio::sync::Mutex<()>,
    next_session_id: AtomicUsize,
    total_streams: AtomicU64,
    shutdown: CancellationToken,
}

impl MuxClient {
    /// Build a client, or `None` when multiplexing is disabled
    pub fn new(
        dialer: Arc<dyn ProxyDialer>,
        options: &MultiplexOptions,
    ) -> Result<Option<Self>, MuxOptionsError> {
        if !options.enabled {
            return Ok(None);
        }
        let (protocol, limits) = options.validate()?;

        debug!(
            "Multiplex client: protocol={}, max_connections={}, min_streams={}, max_streams={}",
            protocol, limits.max_connections, limits.min_streams, limits.max_streams
        );

        Ok(Some(Self {
            dialer,
            protocol,
            limits,
            sessions: Mutex::new(Vec::new()),
            dialing: tokio::sync::Mutex::new(()),
            next_session_id: AtomicUsize::new(0),
            total_streams: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }))
    }

    pub async fn dial_stream(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedStream, TransportError> {
        let stream = self
            .open_stream(ctx, StreamRequest::stream(destination.clone()))
            .await?;
        Ok(Box::new(stream))
    }

    pub async fn dial_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedBoundPacketConn, TransportError> {
        let stream = self
            .open_stream(ctx, StreamRequest::datagram(destination.clone(), false))
            .await?;
        Ok(Box::new(BoundStreamPacketConn::new(
            Box::new(stream),
            destination.clone(),
        )))
    }

    pub async fn listen_datagram(
        &self,
        ctx: &DialContext,
        destination: &SocksAddr,
    ) -> Result<BoxedPacketConn, TransportError> {
        let stream = self
            .open_stream(ctx, StreamRequest::datagram(destination.clone(), true))
            .await?;
        Ok(Box::new(StreamPacketConn::new(Box::new(stream))))
    }

    /// Drop every pooled session. Streams already handed out keep working;
    /// their session closes once the last of them is dropped.
    pub fn reset(&self) {
        let drained: Vec<_> = self.sessions.lock().drain(..).collect();
        if !drained.is_empty() {
            info!("Multiplex pool reset, {} session(s) draining", drained.len());
        }
    }

    /// Close every session. Later dials fail with [`TransportError::Closed`].
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let drained: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in &drained {
            session.close();
        }
        info!("Multiplex client closed ({} session(s))", drained.len());
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> MuxStats {
        let sessions = self.sessions.lock();
        MuxStats {
            sessions: sessions.len(),
            active_streams: sessions.iter().map(|s| s.num_streams()).sum(),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    async fn open_stream(
        &self,
        ctx: &DialContext,
        request: StreamRequest,
    ) -> Result<MuxStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let header = request.encode().map_err(io::Error::from)?;

        let lease = match self.select_session() {
            Some(lease) => lease,
            None => self.acquire_session(ctx).await?,
        };

        let mut stream = ctx.run(lease.open()).await?;
        ctx.run(async {
            stream.write_all(&header).await?;
            stream.flush().await
        })
        .await?;

        self.total_streams.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    fn select_session(&self) -> Option<StreamLease> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|session| !session.is_closed());

        let loads: Vec<usize> = sessions.iter().map(|s| s.num_streams()).collect();
        match self.limits.select(&loads) {
            Selection::Reuse(index) => Some(sessions[index].lease()),
            Selection::Open => None,
        }
    }

    /// Open sessions one at a time. A dial waiting here re-selects once the
    /// previous session is pooled, so `max_connections` holds under bursts.
    async fn acquire_session(&self, ctx: &DialContext) -> Result<StreamLease, TransportError> {
        let _dialing = ctx
            .run(async { Ok::<_, TransportError>(self.dialing.lock().await) })
            .await?;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match self.select_session() {
            Some(lease) => Ok(lease),
            None => self.new_session(ctx).await,
        }
    }

    async fn new_session(&self, ctx: &DialContext) -> Result<StreamLease, TransportError> {
        let mut stream = self
            .dialer
            .dial_stream(ctx, &mux_magic_destination())
            .await?;

        let preface = encode_session_preface(self.protocol);
        ctx.run(async {
            stream.write_all(&preface).await?;
            stream.flush().await
        })
        .await?;

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = MuxSession::spawn(id, stream, self.shutdown.child_token());

        let mut sessions = self.sessions.lock();
        if self.is_closed() {
            session.close();
            return Err(TransportError::Closed);
        }
        let lease = session.lease();
        sessions.push(session);
        debug!("Opened multiplex session {} ({} in pool)", id, sessions.len());
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use badsocks_protocol::{FLAG_ADDR, FLAG_UDP, MUX_MAGIC_ADDRESS, STATUS_ERROR, STATUS_SUCCESS};
    use futures::future::poll_fn;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

    fn limits(max_connections: usize, min_streams: usize, max_streams: usize) -> SessionLimits {
        SessionLimits {
            max_connections,
            min_streams,
            max_streams,
        }
    }

    #[test]
    fn test_options_default_connections() {
        let options = MultiplexOptions {
            enabled: true,
            ..Default::default()
        };
        let (protocol, resolved) = options.validate().unwrap();
        assert_eq!(protocol, MuxProtocol::Yamux);
        assert_eq!(resolved, limits(DEFAULT_MAX_CONNECTIONS, 0, 0));
    }

    #[test]
    fn test_options_rejected() {
        let options = MultiplexOptions {
            enabled: true,
            protocol: "smux".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(MuxOptionsError::Protocol(_))
        ));

        let options = MultiplexOptions {
            enabled: true,
            max_connections: 2,
            max_streams: 8,
            ..Default::default()
        };
        assert_eq!(
            options.validate().unwrap_err(),
            MuxOptionsError::ConflictingLimits
        );

        let options = MultiplexOptions {
            enabled: true,
            min_streams: 9,
            max_streams: 8,
            ..Default::default()
        };
        assert_eq!(
            options.validate().unwrap_err(),
            MuxOptionsError::MinAboveMax { min: 9, max: 8 }
        );
    }

    #[test]
    fn test_options_toml() {
        let options: MultiplexOptions = toml::from_str(
            r#"
            enabled = true
            protocol = "yamux"
            max_streams = 16
            "#,
        )
        .unwrap();
        assert!(options.enabled);
        assert_eq!(options.validate().unwrap().1, limits(0, 0, 16));
    }

    #[test]
    fn test_select_empty_pool() {
        assert_eq!(limits(4, 0, 0).select(&[]), Selection::Open);
        assert_eq!(limits(0, 0, 8).select(&[]), Selection::Open);
    }

    #[test]
    fn test_select_max_connections() {
        let limits = limits(2, 0, 0);
        assert_eq!(limits.select(&[3]), Selection::Open);
        assert_eq!(limits.select(&[3, 1]), Selection::Reuse(1));
    }

    #[test]
    fn test_select_min_streams() {
        let limits = limits(4, 2, 0);
        // the only session has not reached min_streams yet
        assert_eq!(limits.select(&[1]), Selection::Reuse(0));
        assert_eq!(limits.select(&[2]), Selection::Open);
        assert_eq!(limits.select(&[2, 0]), Selection::Reuse(1));
    }

    #[test]
    fn test_select_max_streams() {
        let limits = limits(0, 0, 2);
        assert_eq!(limits.select(&[1]), Selection::Reuse(0));
        assert_eq!(limits.select(&[2]), Selection::Open);
        assert_eq!(limits.select(&[2, 2, 1]), Selection::Reuse(2));
    }

    type Requests = Arc<parking_lot::Mutex<Vec<(u16, SocksAddr)>>>;

    /// Accepts sessions over duplex pipes, answers each stream with `status`
    /// and echoes accepted streams
    struct YamuxServerDialer {
        status: u8,
        latency: Duration,
        sessions: AtomicUsize,
        requests: Requests,
    }

    impl YamuxServerDialer {
        fn new(status: u8) -> Arc<Self> {
            Self::with_latency(status, Duration::ZERO)
        }

        /// Session dials take `latency` to complete
        fn with_latency(status: u8, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                status,
                latency,
                sessions: AtomicUsize::new(0),
                requests: Requests::default(),
            })
        }
    }

    async fn serve_session(mut remote: DuplexStream, status: u8, requests: Requests) -> io::Result<()> {
        let mut preface = [0u8; 2];
        remote.read_exact(&mut preface).await?;
        assert_eq!(preface, encode_session_preface(MuxProtocol::Yamux));

        let mut connection = yamux::Connection::new(
            TokioAsyncReadCompatExt::compat(remote),
            yamux::Config::default(),
            yamux::Mode::Server,
        );
        while let Some(Ok(stream)) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut stream = FuturesAsyncReadCompatExt::compat(stream);
                let flags = stream.read_u16().await?;
                let destination = SocksAddr::read_from(&mut stream).await?;
                requests.lock().push((flags, destination));

                stream.write_all(&[status]).await?;
                if status == STATUS_SUCCESS {
                    let (mut reader, mut writer) = tokio::io::split(stream);
                    tokio::io::copy(&mut reader, &mut writer).await?;
                }
                Ok::<_, io::Error>(())
            });
        }
        Ok(())
    }

    #[async_trait]
    impl ProxyDialer for YamuxServerDialer {
        async fn dial_stream(
            &self,
            _ctx: &DialContext,
            destination: &SocksAddr,
        ) -> Result<BoxedStream, TransportError> {
            assert_eq!(destination.host(), MUX_MAGIC_ADDRESS);
            self.sessions.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let (local, remote) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_session(remote, self.status, self.requests.clone()));
            Ok(Box::new(local))
        }

        async fn dial_datagram(
            &self,
            _ctx: &DialContext,
            _destination: &SocksAddr,
        ) -> Result<BoxedBoundPacketConn, TransportError> {
            Err(TransportError::Closed)
        }

        async fn listen_datagram(
            &self,
            _ctx: &DialContext,
            _destination: &SocksAddr,
        ) -> Result<BoxedPacketConn, TransportError> {
            Err(TransportError::Closed)
        }
    }

    fn enabled(max_connections: usize) -> MultiplexOptions {
        MultiplexOptions {
            enabled: true,
            max_connections,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_returns_none() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer, &MultiplexOptions::default()).unwrap();
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer.clone(), &enabled(1)).unwrap().unwrap();
        let ctx = DialContext::new();

        let mut stream = client
            .dial_stream(&ctx, &"example.com:443".parse().unwrap())
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        let requests = dialer.requests.lock().clone();
        assert_eq!(requests, vec![(0, "example.com:443".parse().unwrap())]);

        let stats = client.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.active_streams, 1);
        drop(stream);
        assert_eq!(client.stats().active_streams, 0);
    }

    #[tokio::test]
    async fn test_streams_share_session() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer.clone(), &enabled(1)).unwrap().unwrap();
        let ctx = DialContext::new();

        let first = client
            .dial_stream(&ctx, &"a.example:80".parse().unwrap())
            .await
            .unwrap();
        let second = client
            .dial_stream(&ctx, &"b.example:80".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(dialer.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(client.stats().active_streams, 2);
        drop((first, second));
    }

    async fn burst(max_connections: usize, dials: usize) -> (Arc<YamuxServerDialer>, MuxStats) {
        let dialer = YamuxServerDialer::with_latency(STATUS_SUCCESS, Duration::from_millis(10));
        let client = Arc::new(
            MuxClient::new(dialer.clone(), &enabled(max_connections))
                .unwrap()
                .unwrap(),
        );

        let handles: Vec<_> = (0..dials)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let destination: SocksAddr = format!("host{}.example:80", i).parse().unwrap();
                    client.dial_stream(&DialContext::new(), &destination).await
                })
            })
            .collect();

        let mut streams = Vec::new();
        for handle in handles {
            streams.push(handle.await.unwrap().unwrap());
        }
        let stats = client.stats();
        drop(streams);
        (dialer, stats)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dials_share_one_session() {
        let (dialer, stats) = burst(1, 8).await;
        assert_eq!(dialer.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.active_streams, 8);
        assert_eq!(stats.total_streams, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dials_respect_max_connections() {
        let (dialer, stats) = burst(2, 8).await;
        assert_eq!(dialer.sessions.load(Ordering::SeqCst), 2);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.active_streams, 8);
    }

    #[tokio::test]
    async fn test_datagram_flows() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer.clone(), &enabled(1)).unwrap().unwrap();
        let ctx = DialContext::new();
        let destination: SocksAddr = "example.com:53".parse().unwrap();

        let bound = client.dial_datagram(&ctx, &destination).await.unwrap();
        bound.send(b"query").await.unwrap();
        let mut buf = [0u8; 64];
        let n = bound.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");

        let unbound = client.listen_datagram(&ctx, &destination).await.unwrap();
        let other: SocksAddr = "9.9.9.9:53".parse().unwrap();
        unbound.send_to(b"q", &other).await.unwrap();
        let (n, from) = unbound.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"q");
        assert_eq!(from, other);

        let flags: Vec<u16> = dialer.requests.lock().iter().map(|(f, _)| *f).collect();
        assert_eq!(flags, vec![FLAG_UDP, FLAG_UDP | FLAG_ADDR]);
        assert_eq!(dialer.sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_stream() {
        let dialer = YamuxServerDialer::new(STATUS_ERROR);
        let client = MuxClient::new(dialer, &enabled(1)).unwrap().unwrap();

        let mut stream = client
            .dial_stream(&DialContext::new(), &"example.com:443".parse().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_reset_keeps_open_streams() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer.clone(), &enabled(1)).unwrap().unwrap();
        let ctx = DialContext::new();

        let mut stream = client
            .dial_stream(&ctx, &"example.com:443".parse().unwrap())
            .await
            .unwrap();
        client.reset();
        assert_eq!(client.stats().sessions, 0);

        // handed-out stream still works after the reset
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        // the next dial opens a fresh session
        let _next = client
            .dial_stream(&ctx, &"example.com:443".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(dialer.sessions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dialer = YamuxServerDialer::new(STATUS_SUCCESS);
        let client = MuxClient::new(dialer, &enabled(1)).unwrap().unwrap();
        let ctx = DialContext::new();

        let _stream = client
            .dial_stream(&ctx, &"example.com:443".parse().unwrap())
            .await
            .unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.stats().sessions, 0);

        let result = client
            .dial_stream(&ctx, &"example.com:443".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
