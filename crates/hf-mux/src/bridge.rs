//! Bridging a channel to a local byte stream
//!
//! Forwarded connections on either side reduce to the same shape: copy a
//! TCP or unix stream into a channel and the channel back into the
//! stream until one side finishes. Channel closure follows the stream's
//! EOF (flush-then-FIN) and stream shutdown follows the channel's
//! end-of-stream, so a connection ending on one host ends cleanly on the
//! other, independent of transport reconnects in between.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::channel::Channel;

/// Read buffer for the stream-to-channel direction
const BRIDGE_BUF: usize = 16 * 1024;

/// Stream a local connection through a channel until either side ends.
///
/// Errors on the local stream close the channel; a closed channel shuts
/// the local stream down. Neither outcome affects any other channel.
pub async fn bridge_stream<S>(channel: Channel, stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (sender, mut receiver) = channel.split();
    let (mut stream_rx, mut stream_tx) = tokio::io::split(stream);

    let inbound = async move {
        let mut buf = [0u8; BRIDGE_BUF];
        loop {
            match stream_rx.read(&mut buf).await {
                // EOF: flush queued bytes, then Close
                Ok(0) => break,
                Ok(n) => {
                    if sender.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        // Channel closed by the peer; stop reading
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!("forward stream read ended: {}", err);
                    break;
                }
            }
        }
        sender.close();
    };

    let outbound = async move {
        while let Some(chunk) = receiver.recv().await {
            if let Err(err) = stream_tx.write_all(&chunk).await {
                tracing::debug!("forward stream write ended: {}", err);
                return;
            }
        }
        let _ = stream_tx.shutdown().await;
    };

    tokio::join!(inbound, outbound);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{client_resume, server_accept};
    use crate::mux::{Mux, MuxConfig, MuxEvent, Side};
    use hf_protocol::{SessionToken, TermSize};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    // Wire two muxes over a duplex pipe; the cross-crate drop/resume
    // scenarios live in tests/mux_roundtrip.rs
    async fn bind(client: &Arc<Mux>, server: &Arc<Mux>) -> CancellationToken {
        let token = SessionToken::generate();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_result, server_result) = tokio::join!(
            client_resume(client_io, &token, 0, "xterm", TermSize::default()),
            server_accept(server_io, &token, 0),
        );
        let (client_framed, client_replay) = client_result.unwrap();
        let (server_framed, hello) = server_result.unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn({
            let mux = Arc::clone(client);
            let cancel = cancel.clone();
            async move { mux.run(client_framed, client_replay, cancel).await }
        });
        tokio::spawn({
            let mux = Arc::clone(server);
            let cancel = cancel.clone();
            async move { mux.run(server_framed, hello.recv_cursor, cancel).await }
        });
        cancel
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions_and_closes() {
        use hf_protocol::ChannelKind;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, _client_events) = Mux::new(Side::Client, MuxConfig::default());
        let (server, mut server_events) = Mux::new(Side::Server, MuxConfig::default());
        let (client, server) = (Arc::new(client), Arc::new(server));
        let _client_term = client.take_terminal();
        let _server_term = server.take_terminal();

        let cancel = bind(&client, &server).await;

        // Server-side bridge endpoint: an in-memory "local connection"
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let accept_task = tokio::spawn(async move {
            match server_events.recv().await {
                Some(MuxEvent::Incoming(incoming)) => {
                    let channel = incoming.accept().await.unwrap();
                    bridge_stream(channel, remote).await;
                }
                _ => panic!("expected incoming channel"),
            }
        });

        let channel = client
            .open_channel(ChannelKind::ForwardedAgent, None)
            .await
            .unwrap();

        // Channel -> stream
        channel.send(Bytes::from_static(b"request")).await.unwrap();
        let (mut local_rx, mut local_tx) = tokio::io::split(local);
        let mut buf = [0u8; 7];
        local_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        // Stream -> channel, then EOF propagates as end-of-stream
        local_tx.write_all(b"response").await.unwrap();
        local_tx.shutdown().await.unwrap();

        let (tx, mut rx) = channel.split();
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"response");

        // Close our half too, so the bridge task finishes both directions
        tx.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), accept_task)
            .await
            .expect("bridge did not finish")
            .unwrap();
        cancel.cancel();
    }
}
