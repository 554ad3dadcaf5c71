//! The resumption handshake
//!
//! The first exchange on every fresh transport, before the multiplexer
//! binds it. Each side presents its receive cursor; the other side
//! replays its retained frames from exactly that offset. The same
//! exchange serves first attach (cursors at zero) and every reconnect.

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use hf_core::Transport;
use hf_protocol::{
    Frame, FrameCodec, Message, ProtocolError, SessionToken, TermSize, PROTOCOL_VERSION,
};

use crate::error::HandshakeError;

/// What the client announced when it attached
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// Client's receive cursor; the daemon replays from here
    pub recv_cursor: u64,
    /// TERM for the shell environment
    pub term: String,
    /// Client terminal geometry at attach time
    pub size: TermSize,
}

/// Client side: request resumption of `token` on a fresh transport.
///
/// Returns the framed transport and the daemon's receive cursor (the
/// client's replay point). A daemon with no record of the session
/// answers `accepted: false`, surfaced as [`HandshakeError::Rejected`],
/// never a hang.
pub async fn client_resume<T: Transport>(
    transport: T,
    token: &SessionToken,
    recv_cursor: u64,
    term: &str,
    size: TermSize,
) -> Result<(Framed<T, FrameCodec>, u64), HandshakeError> {
    let mut framed = Framed::new(transport, FrameCodec::new());

    framed
        .send(Frame::control(Message::ResumeRequest {
            token: token.clone(),
            recv_cursor,
            version: PROTOCOL_VERSION.to_string(),
            term: term.to_string(),
            size,
        }))
        .await?;

    match framed.next().await {
        None => Err(HandshakeError::TransportClosed),
        Some(Err(err)) => Err(err.into()),
        Some(Ok(frame)) => match frame.message {
            Message::ResumeResponse {
                accepted: true,
                recv_cursor,
                ..
            } => Ok((framed, recv_cursor)),
            Message::ResumeResponse {
                accepted: false,
                reason,
                ..
            } => Err(HandshakeError::Rejected {
                reason: reason.unwrap_or_else(|| "unknown session".to_string()),
            }),
            other => Err(ProtocolError::UnexpectedFrame(other.frame_type()).into()),
        },
    }
}

/// Daemon side: accept (or reject) a resumption request on a fresh
/// transport.
///
/// Validates the token against the daemon's own session and the client's
/// protocol version, answers, and returns the client's announcement. The
/// caller replays from `ClientHello::recv_cursor`.
pub async fn server_accept<T: Transport>(
    transport: T,
    expected: &SessionToken,
    recv_cursor: u64,
) -> Result<(Framed<T, FrameCodec>, ClientHello), HandshakeError> {
    let mut framed = Framed::new(transport, FrameCodec::new());

    let request = match framed.next().await {
        None => return Err(HandshakeError::TransportClosed),
        Some(Err(err)) => return Err(err.into()),
        Some(Ok(frame)) => frame,
    };

    let (token, client_cursor, version, term, size) = match request.message {
        Message::ResumeRequest {
            token,
            recv_cursor,
            version,
            term,
            size,
        } => (token, recv_cursor, version, term, size),
        other => {
            return Err(ProtocolError::UnexpectedFrame(other.frame_type()).into());
        }
    };

    if token != *expected {
        let reason = "unknown session".to_string();
        reject(&mut framed, &reason).await?;
        return Err(HandshakeError::Rejected { reason });
    }

    if major_version(&version) != major_version(PROTOCOL_VERSION) {
        let reason = format!(
            "protocol version mismatch: client {}, session {}",
            version, PROTOCOL_VERSION
        );
        reject(&mut framed, &reason).await?;
        return Err(HandshakeError::Rejected { reason });
    }

    framed
        .send(Frame::control(Message::ResumeResponse {
            accepted: true,
            reason: None,
            recv_cursor,
        }))
        .await?;

    Ok((
        framed,
        ClientHello {
            recv_cursor: client_cursor,
            term,
            size,
        },
    ))
}

/// Answer a resume attempt for a session this host has no record of.
///
/// Used by the attach bridge when the session daemon is gone (reaped or
/// never created): the client gets a definitive rejection instead of a
/// dead transport, and falls back to a fresh session.
pub async fn reject_unknown<T: Transport>(
    transport: T,
    reason: &str,
) -> Result<(), ProtocolError> {
    let mut framed = Framed::new(transport, FrameCodec::new());
    // Read the client's request first so the rejection is not lost in a
    // half-open pipe teardown
    let _ = framed.next().await;
    reject(&mut framed, reason).await
}

async fn reject<T: Transport>(
    framed: &mut Framed<T, FrameCodec>,
    reason: &str,
) -> Result<(), ProtocolError> {
    framed
        .send(Frame::control(Message::ResumeResponse {
            accepted: false,
            reason: Some(reason.to_string()),
            recv_cursor: 0,
        }))
        .await
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_accepts_matching_token() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let token = SessionToken::generate();

        let client = client_resume(client_io, &token, 42, "xterm", TermSize::default());
        let server = server_accept(server_io, &token, 99);

        let (client_result, server_result) = tokio::join!(client, server);

        let (_, client_replay_from) = client_result.unwrap();
        let (_, hello) = server_result.unwrap();

        // Each side learns the other's cursor
        assert_eq!(client_replay_from, 99);
        assert_eq!(hello.recv_cursor, 42);
        assert_eq!(hello.term, "xterm");
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_token() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let known = SessionToken::generate();
        let presented = SessionToken::generate();

        let client = client_resume(client_io, &presented, 0, "xterm", TermSize::default());
        let server = server_accept(server_io, &known, 0);

        let (client_result, server_result) = tokio::join!(client, server);

        assert!(matches!(
            client_result,
            Err(HandshakeError::Rejected { .. })
        ));
        assert!(matches!(
            server_result,
            Err(HandshakeError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_unknown_never_hangs_the_client() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let token = SessionToken::generate();

        let client = client_resume(client_io, &token, 0, "xterm", TermSize::default());
        let server = reject_unknown(server_io, "session was reaped");

        let (client_result, server_result) = tokio::join!(client, server);

        server_result.unwrap();
        match client_result {
            Err(HandshakeError::Rejected { reason }) => {
                assert!(reason.contains("reaped"));
            }
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }
}
