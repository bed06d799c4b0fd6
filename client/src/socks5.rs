//! SOCKS5 proxy server

use anyhow::Result;
use badsocks_outbound::{InboundContext, Outbound};
use badsocks_protocol::{ATYP_IPV4, SocksAddr};
use badsocks_transport::DialContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Inbound tag reported to the outbound
const INBOUND_TAG: &str = "socks";

/// Run the SOCKS5 server on `bind`
pub async fn run(bind: SocketAddr, outbound: Arc<dyn Outbound>, ctx: DialContext) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("SOCKS5 server listening on {}", listener.local_addr()?);
    serve(listener, outbound, ctx).await
}

/// Accept connections until `ctx` is cancelled
pub async fn serve(listener: TcpListener, outbound: Arc<dyn Outbound>, ctx: DialContext) -> Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = ctx.token().cancelled() => return Ok(()),
        };
        debug!("New connection from {}", addr);

        let outbound = outbound.clone();
        let ctx = ctx.child();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, outbound, ctx).await {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Handle a single SOCKS5 connection
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    outbound: Arc<dyn Outbound>,
    ctx: DialContext,
) -> Result<()> {
    // 1. Handshake
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(anyhow::anyhow!("Invalid SOCKS version: {}", version));
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(anyhow::anyhow!("No acceptable auth method"));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    // 2. Request
    let version = stream.read_u8().await?;
    let cmd = stream.read_u8().await?;
    let _rsv = stream.read_u8().await?;

    if version != SOCKS5_VERSION {
        return Err(anyhow::anyhow!("Invalid version in request"));
    }

    let target = SocksAddr::read_from(&mut stream).await?;

    if cmd != CMD_CONNECT {
        send_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(anyhow::anyhow!("Unsupported command: {}", cmd));
    }

    debug!("Connection from {} to {}", addr, target);
    send_reply(&mut stream, REP_SUCCESS).await?;

    // 3. Hand over to the outbound
    let metadata = InboundContext::new(INBOUND_TAG, target).with_source(addr);
    outbound
        .new_connection(&ctx, Box::new(stream), metadata)
        .await?;

    Ok(())
}

/// Send SOCKS5 reply
async fn send_reply(stream: &mut TcpStream, rep: u8) -> Result<()> {
    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    // We send 0.0.0.0:0 as bound address
    let reply = [
        SOCKS5_VERSION,
        rep,
        0x00, // RSV
        ATYP_IPV4,
        0, 0, 0, 0, // BND.ADDR
        0, 0, // BND.PORT
    ];
    stream.write_all(&reply).await?;
    Ok(())
}
