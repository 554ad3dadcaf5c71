//! Transport and bootstrap abstractions
//!
//! A transport is one physical connection instance: one invocation of the
//! remote-login mechanism, presenting a bidirectional byte stream. The
//! session outlives any transport; the reconnect controller replaces them
//! freely. Keeping the bootstrap behind a trait lets tests drive the
//! whole controller with in-memory duplex transports.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::BootstrapError;
use hf_protocol::SessionToken;

/// A bidirectional byte stream carrying one session's frames.
///
/// Blanket-implemented for anything async-readable and -writable; the
/// concrete types are an ssh child's stdio in production and
/// `tokio::io::DuplexStream` in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Owned, type-erased transport
pub type BoxedTransport = Box<dyn Transport>;

/// The seam to the external remote-login mechanism.
///
/// The contract is deliberately small: attach a transport to a session
/// token, creating the remote session when `create` is set. The
/// implementation is re-invoked on demand, once per reconnect attempt.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Establish one transport to the session daemon for `token`.
    ///
    /// With `create` set, a missing remote session is created; without
    /// it, a missing session is reported through the resumption
    /// handshake (the transport still comes up and carries the
    /// rejection), so this only fails when no byte stream could be
    /// established at all.
    async fn connect(
        &self,
        token: &SessionToken,
        create: bool,
    ) -> Result<BoxedTransport, BootstrapError>;
}

/// Join an independent reader and writer into one [`Transport`].
///
/// The two halves of a transport often arrive separately: the ssh
/// child's stdout/stdin on the client, the attach process's own
/// stdin/stdout on the remote host.
pub struct StreamPair<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StreamPair<R, W> {
    /// Pair a reader and a writer
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for StreamPair<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for StreamPair<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_pair_joins_halves() {
        let (near, far) = tokio::io::duplex(1024);
        let (far_read, far_write) = tokio::io::split(far);
        let mut pair = StreamPair::new(far_read, far_write);

        let (mut near_read, mut near_write) = tokio::io::split(near);

        near_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        pair.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        pair.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        near_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}

