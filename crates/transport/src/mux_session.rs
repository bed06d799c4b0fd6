//! One multiplexed session: a yamux client connection over a proxied stream

use crate::TransportError;
use badsocks_protocol::{BoxedStream, STATUS_SUCCESS};
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use yamux::{Connection, ConnectionError, Mode};

type OpenRequest = oneshot::Sender<Result<yamux::Stream, TransportError>>;

/// Handle to a running session. The driver task keeps the connection alive
/// while any handle (pooled or leased by a stream) exists.
pub(crate) struct MuxSession {
    id: usize,
    requests: mpsc::UnboundedSender<OpenRequest>,
    streams: AtomicUsize,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl MuxSession {
    /// Start a yamux client over `stream` (the session preface is already sent)
    pub(crate) fn spawn(id: usize, stream: BoxedStream, shutdown: CancellationToken) -> Arc<Self> {
        let connection = Connection::new(
            TokioAsyncReadCompatExt::compat(stream),
            yamux::Config::default(),
            Mode::Client,
        );
        let (requests, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(drive(
            id,
            connection,
            receiver,
            shutdown.clone(),
            closed.clone(),
        ));

        Arc::new(Self {
            id,
            requests,
            streams: AtomicUsize::new(0),
            closed,
            shutdown,
        })
    }

    pub(crate) fn num_streams(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Reserve a stream slot. The slot is released when the lease drops.
    pub(crate) fn lease(self: &Arc<Self>) -> StreamLease {
        self.streams.fetch_add(1, Ordering::AcqRel);
        StreamLease {
            session: self.clone(),
        }
    }

    /// Stop the session, failing streams that are still open
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    async fn open(&self) -> Result<yamux::Stream, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// Keeps a session alive and counted for the lifetime of one logical stream
pub(crate) struct StreamLease {
    session: Arc<MuxSession>,
}

impl StreamLease {
    /// Open the logical stream this lease was taken for
    pub(crate) async fn open(self) -> Result<MuxStream, TransportError> {
        let stream = self.session.open().await?;
        trace!("Opened stream on session {}", self.session.id);
        Ok(MuxStream {
            inner: FuturesAsyncReadCompatExt::compat(stream),
            status_pending: true,
            _lease: self,
        })
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.session.streams.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn drive(
    id: usize,
    mut connection: Connection<Compat<BoxedStream>>,
    mut requests: mpsc::UnboundedReceiver<OpenRequest>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
) {
    let mut pending: VecDeque<OpenRequest> = VecDeque::new();
    let cancelled = shutdown.cancelled();
    tokio::pin!(cancelled);

    let result = poll_fn(|cx| -> Poll<Result<(), ConnectionError>> {
        if cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }

        loop {
            match requests.poll_recv(cx) {
                Poll::Ready(Some(request)) => pending.push_back(request),
                // every handle is gone, nothing can use this session again
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => break,
            }
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(request) = pending.pop_front() {
                        let _ = request.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        loop {
            match ready!(connection.poll_next_inbound(cx)) {
                Some(Ok(_stream)) => {
                    trace!("Session {} dropping inbound stream", id);
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    })
    .await;

    closed.store(true, Ordering::Release);
    requests.close();

    match result {
        Ok(()) => {
            if let Err(e) = poll_fn(|cx| connection.poll_close(cx)).await {
                debug!("Session {} close error: {}", id, e);
            }
            debug!("Session {} closed", id);
        }
        Err(e) => warn!("Session {} terminated: {}", id, e),
    }

    for request in pending.drain(..) {
        let _ = request.send(Err(TransportError::Closed));
    }
    while let Ok(request) = requests.try_recv() {
        let _ = request.send(Err(TransportError::Closed));
    }
}

/// Logical stream inside a session.
///
/// The server answers every stream request with a status byte, consumed on
/// the first read.
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    status_pending: bool,
    _lease: StreamLease,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.status_pending {
            let mut status = [0u8; 1];
            let mut status_buf = ReadBuf::new(&mut status);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut status_buf))?;
            let received = status_buf.filled().len();

            if received == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Stream closed before status",
                )));
            }
            this.status_pending = false;
            if status[0] != STATUS_SUCCESS {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("Remote rejected stream (status {})", status[0]),
                )));
            }
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
