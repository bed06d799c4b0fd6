//! Relaying accepted connections through a dialed one

use crate::OutboundError;
use badsocks_protocol::{BoxedStream, MAX_DATAGRAM_SIZE, PacketConn};
use badsocks_transport::DialContext;
use std::io;
use tracing::trace;

/// Copy both directions until each side has shut down. Returns the bytes
/// sent to and received from `outbound`.
pub async fn copy_stream(
    ctx: &DialContext,
    mut inbound: BoxedStream,
    mut outbound: BoxedStream,
) -> Result<(u64, u64), OutboundError> {
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            result.map_err(OutboundError::Relay)
        }
        _ = ctx.token().cancelled() => Err(OutboundError::Canceled),
    }
}

async fn forward(from: &dyn PacketConn, to: &dyn PacketConn) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, peer) = from.recv_from(&mut buf).await?;
        trace!("Forwarding {} byte datagram for {}", n, peer);
        to.send_to(&buf[..n], &peer).await?;
    }
}

/// Forward datagrams both ways until either side fails or `ctx` is cancelled.
///
/// Datagrams read from `inbound` are sent to the address they carry;
/// replies from `outbound` are sent back tagged with their source.
pub async fn copy_packets(
    ctx: &DialContext,
    inbound: &dyn PacketConn,
    outbound: &dyn PacketConn,
) -> Result<(), OutboundError> {
    let result = tokio::select! {
        result = forward(inbound, outbound) => result,
        result = forward(outbound, inbound) => result,
        _ = ctx.token().cancelled() => return Ok(()),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
        Err(e) => Err(OutboundError::Relay(e)),
        Ok(()) => Ok(()),
    }
}
