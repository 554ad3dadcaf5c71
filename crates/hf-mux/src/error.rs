//! Multiplexer error and disconnect types

use hf_protocol::ProtocolError;
use thiserror::Error;

/// Why a transport stopped carrying the session.
///
/// Only `SessionEnded` is terminal for the session; every other reason
/// leaves the session alive and is handled by reconnecting.
#[derive(Debug)]
pub enum Disconnect {
    /// The transport died or went silent past the grace interval
    TransportLost(String),
    /// The peer sent something unintelligible; the transport is dropped
    /// but the session survives
    ProtocolViolation(ProtocolError),
    /// The remote shell exited; the session is over
    SessionEnded { exit_code: Option<i32> },
    /// The caller cancelled this transport binding (e.g. superseded by a
    /// newer one)
    Cancelled,
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::TransportLost(reason) => write!(f, "transport lost: {}", reason),
            Disconnect::ProtocolViolation(err) => write!(f, "protocol violation: {}", err),
            Disconnect::SessionEnded { exit_code } => {
                write!(f, "session ended (exit code {:?})", exit_code)
            }
            Disconnect::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors surfaced to channel owners and openers
#[derive(Error, Debug)]
pub enum MuxError {
    /// The channel was closed locally or by the peer
    #[error("Channel closed")]
    ChannelClosed,

    /// The peer rejected the channel open
    #[error("Channel open rejected: {reason}")]
    OpenRejected { reason: String },

    /// The session was torn down while the operation was in flight
    #[error("Session torn down")]
    SessionDown,
}

/// Errors during the resumption handshake on a fresh transport
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The remote has no record of the session (reaped or never created)
    #[error("Session resumption rejected: {reason}")]
    Rejected { reason: String },

    /// The transport closed before the handshake completed
    #[error("Transport closed during handshake")]
    TransportClosed,

    /// Malformed or unexpected handshake traffic
    #[error("Protocol error during handshake: {0}")]
    Protocol(#[from] ProtocolError),
}
