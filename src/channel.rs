//! Length-prefixed framing over a TCP stream.
//!
//! Each frame is a 4-byte big-endian payload length followed by exactly that
//! many payload bytes. Reads use `read_exact`, so a frame split across any
//! number of socket reads reassembles to the same bytes.
//!
//! A [`Connection`] carries one request/response conversation at a time.
//! Callers that need concurrency open more connections.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Frames larger than this are rejected unless a caller configures otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::protocol(format!("frame of {} bytes is too large", payload.len())))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(map_write_err)?;
    writer.write_all(payload).await.map_err(map_write_err)?;
    writer.flush().await.map_err(map_write_err)?;
    Ok(())
}

/// Read one frame, blocking until it is complete.
///
/// End of stream, whether between frames or mid-frame, is reported as
/// [`Error::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(map_read_err)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_bytes {
        return Err(Error::protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_read_err)?;
    Ok(payload)
}

fn map_read_err(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}

fn map_write_err(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}

/// A framed connection to a peer.
///
/// Opening a connection executes nothing on the peer; work starts only when
/// a request frame is sent.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_bytes: usize,
}

impl Connection {
    /// Connect to `address`, failing with [`Error::Connection`] when the peer
    /// refuses and [`Error::Timeout`] when it does not answer in time.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(|source| Error::Connection {
                address: address.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "channel connected");
        Ok(Self::from_stream(stream, peer))
    }

    /// Wrap an accepted stream (engine side).
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.stream, self.max_frame_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Serves its buffer at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let end = (self.pos + self.step)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let chunk = self.data[self.pos..end].to_vec();
            buf.put_slice(&chunk);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    async fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, payload).await.unwrap();
        out
    }

    #[tokio::test]
    async fn frame_layout_is_big_endian_length_prefix() {
        let bytes = encode(b"abc").await;
        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn split_reads_reassemble_identically() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let wire = encode(&payload).await;

        let mut whole = &wire[..];
        let in_one = read_frame(&mut whole, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

        for step in [1, 3, 7, 4096] {
            let mut trickle = Trickle {
                data: wire.clone(),
                pos: 0,
                step,
            };
            let split = read_frame(&mut trickle, DEFAULT_MAX_FRAME_BYTES)
                .await
                .unwrap();
            assert_eq!(split, in_one, "step {}", step);
        }
        assert_eq!(in_one, payload);
    }

    #[tokio::test]
    async fn consecutive_frames_stay_delimited() {
        let mut wire = encode(b"first").await;
        wire.extend(encode(b"").await);
        wire.extend(encode(b"third").await);
        let mut r = Trickle {
            data: wire,
            pos: 0,
            step: 2,
        };
        assert_eq!(read_frame(&mut r, 1024).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut r, 1024).await.unwrap(), b"");
        assert_eq!(read_frame(&mut r, 1024).await.unwrap(), b"third");
        assert!(matches!(
            read_frame(&mut r, 1024).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_connection_closed() {
        let mut wire = encode(b"complete payload").await;
        wire.truncate(wire.len() - 4);
        let mut r = &wire[..];
        assert!(matches!(
            read_frame(&mut r, 1024).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let wire = encode(&[0u8; 32]).await;
        let mut r = &wire[..];
        assert!(matches!(read_frame(&mut r, 16).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn duplex_roundtrip_with_small_buffer() {
        let (mut a, mut b) = tokio::io::duplex(5);
        let payload = b"a payload much longer than the duplex buffer".to_vec();
        let expected = payload.clone();
        let writer = tokio::spawn(async move { write_frame(&mut a, &payload).await });
        let got = read_frame(&mut b, 1024).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn connect_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = Connection::connect(&addr, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_channel_fault());
    }
}
