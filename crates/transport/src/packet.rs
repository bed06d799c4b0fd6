//! Datagrams carried over a byte stream with a 16-bit length prefix

use async_trait::async_trait;
use badsocks_protocol::{
    encode_datagram, BoundPacketConn, BoxedStream, PacketConn, SocksAddr,
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

/// Read one `[len u16 BE][payload]` frame into `buf`. A payload larger than
/// `buf` is truncated and the remainder discarded.
async fn read_payload<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let n = len.min(buf.len());
    reader.read_exact(&mut buf[..n]).await?;

    if len > n {
        let rest = (len - n) as u64;
        let discarded = tokio::io::copy(&mut reader.take(rest), &mut tokio::io::sink()).await?;
        if discarded < rest {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        trace!("Truncated datagram of {} bytes to {}", len, n);
    }
    Ok(n)
}

/// Address mode: every datagram carries its own target or source address
pub struct StreamPacketConn {
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
}

impl StreamPacketConn {
    pub fn new(stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl PacketConn for StreamPacketConn {
    async fn send_to(&self, payload: &[u8], target: &SocksAddr) -> io::Result<usize> {
        let frame = encode_datagram(Some(target), payload)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(payload.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocksAddr)> {
        let mut reader = self.reader.lock().await;
        let from = SocksAddr::read_from(&mut *reader).await?;
        let n = read_payload(&mut *reader, buf).await?;
        Ok((n, from))
    }
}

/// Connect mode: every datagram goes to and comes from one peer
pub struct BoundStreamPacketConn {
    peer: SocksAddr,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
}

impl BoundStreamPacketConn {
    pub fn new(stream: BoxedStream, peer: SocksAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl BoundPacketConn for BoundStreamPacketConn {
    fn peer(&self) -> &SocksAddr {
        &self.peer
    }

    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let frame = encode_datagram(None, payload)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(payload.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        read_payload(&mut *reader, buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use badsocks_protocol::MAX_DATAGRAM_SIZE;

    #[tokio::test]
    async fn test_bound_send_recv() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let peer: SocksAddr = "example.com:53".parse().unwrap();
        let conn = BoundStreamPacketConn::new(Box::new(local), peer.clone());
        assert_eq!(conn.peer(), &peer);

        assert_eq!(conn.send(b"query").await.unwrap(), 5);
        let mut frame = [0u8; 7];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"\x00\x05query");

        remote.write_all(b"\x00\x06answer").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"answer");
    }

    #[tokio::test]
    async fn test_addressed_send_recv() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = StreamPacketConn::new(Box::new(local));

        let target: SocksAddr = "1.1.1.1:53".parse().unwrap();
        conn.send_to(b"hi", &target).await.unwrap();

        let mut frame = vec![0u8; target.serialized_len() + 4];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, encode_datagram(Some(&target), b"hi").unwrap());

        let source: SocksAddr = "8.8.8.8:53".parse().unwrap();
        let reply = encode_datagram(Some(&source), b"back").unwrap();
        remote.write_all(&reply).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
        assert_eq!(from, source);
    }

    #[tokio::test]
    async fn test_oversized_read_truncated() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = BoundStreamPacketConn::new(Box::new(local), "1.1.1.1:53".parse().unwrap());

        remote.write_all(b"\x00\x0aabcdefghij").await.unwrap();
        remote.write_all(b"\x00\x02ok").await.unwrap();

        let mut small = [0u8; 4];
        let n = conn.recv(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");

        // the rest of the first frame was discarded
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (local, _remote) = tokio::io::duplex(1024);
        let conn = BoundStreamPacketConn::new(Box::new(local), "1.1.1.1:53".parse().unwrap());

        let payload = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let err = conn.send(&payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_recv_eof() {
        let (local, remote) = tokio::io::duplex(1024);
        let conn = BoundStreamPacketConn::new(Box::new(local), "1.1.1.1:53".parse().unwrap());
        drop(remote);

        let mut buf = [0u8; 16];
        let err = conn.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
