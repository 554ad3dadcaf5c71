//! Frame types and control payloads for the Holdfast protocol
//!
//! Frames multiplex logical channels over one transport byte stream.
//! `Data` frames carry a channel's raw bytes; every other type carries a
//! bincode-encoded control payload.
//!
//! # Reliable vs. ephemeral frames
//!
//! `Data`, `Open`, `OpenAck`, `Close`, `Resize`, and `SessionEnd` occupy
//! the per-direction reliable byte stream: their payload bytes advance the
//! sender's sequence counter and are retained for replay until the peer
//! acknowledges them. Channel lifecycle and terminal geometry therefore
//! survive transport replacement with the same exactly-once guarantee as
//! terminal data.
//!
//! `Ack`, `Heartbeat`, `ResumeRequest`, and `ResumeResponse` are ephemeral:
//! they carry sequence 0, are never retained, and are meaningful only for
//! the transport they were sent on.
//!
//! # Message flow
//!
//! 1. Transport established; client sends `ResumeRequest`, the daemon
//!    answers `ResumeResponse` (the resumption handshake).
//! 2. Both sides replay their unacknowledged reliable frames.
//! 3. Terminal I/O flows as `Data` on channel 1; forwarded connections
//!    open their own channels with `Open`/`OpenAck` and end with `Close`.
//! 4. `Ack` reports the receive cursor; `Heartbeat` fills outgoing silence.
//! 5. Shell exit ends the session with `SessionEnd`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::session::SessionToken;

/// Current protocol version string.
///
/// Carried in `ResumeRequest` so the daemon can reject a client it cannot
/// speak to instead of misinterpreting frames. Format: "MAJOR.MINOR".
pub const PROTOCOL_VERSION: &str = "1.0";

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TermSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// What kind of stream a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// The interactive shell, one per session
    Terminal,
    /// One forwarded TCP connection
    ForwardedPort,
    /// One forwarded credential-agent connection
    ForwardedAgent,
}

/// Remote endpoint a forwarded-port channel should connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    /// Hostname or address, resolved on the connecting side
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl std::fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Frame type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Raw channel bytes
    Data = 0x01,
    /// Request to open a channel
    Open = 0x02,
    /// Accept or reject a channel open
    OpenAck = 0x03,
    /// No more data from the sender on this channel
    Close = 0x04,
    /// Receive-cursor report
    Ack = 0x05,
    /// Liveness signal during outgoing silence
    Heartbeat = 0x06,
    /// Client side of the resumption handshake
    ResumeRequest = 0x07,
    /// Daemon side of the resumption handshake
    ResumeResponse = 0x08,
    /// Terminal geometry change
    Resize = 0x09,
    /// Shell exited; session is over
    SessionEnd = 0x0A,
}

impl FrameType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Open),
            0x03 => Some(Self::OpenAck),
            0x04 => Some(Self::Close),
            0x05 => Some(Self::Ack),
            0x06 => Some(Self::Heartbeat),
            0x07 => Some(Self::ResumeRequest),
            0x08 => Some(Self::ResumeResponse),
            0x09 => Some(Self::Resize),
            0x0A => Some(Self::SessionEnd),
            _ => None,
        }
    }

    /// Whether frames of this type occupy the reliable sequenced stream
    pub fn reliable(&self) -> bool {
        matches!(
            self,
            Self::Data | Self::Open | Self::OpenAck | Self::Close | Self::Resize | Self::SessionEnd
        )
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Raw channel bytes
    Data(Bytes),

    /// Open a channel (id chosen by the initiator, carried in the header)
    Open {
        /// What the channel carries
        kind: ChannelKind,
        /// Connect target for forwarded-port channels
        target: Option<ForwardTarget>,
    },

    /// Answer to `Open`
    OpenAck {
        /// Whether the peer accepted the channel
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// Half-close: no more data from the sender on this channel.
    /// The peer echoes `Close` back, completing the shutdown.
    Close,

    /// Cumulative receive cursor for the sender's direction
    Ack {
        /// Reliable-stream offset below which everything was delivered
        offset: u64,
    },

    /// Liveness signal
    Heartbeat {
        /// Unix millis, for latency observation in logs
        timestamp: u64,
    },

    /// First frame on every new transport, client to daemon
    ResumeRequest {
        /// Session to attach to
        token: SessionToken,
        /// Client's receive cursor; the daemon replays from here
        recv_cursor: u64,
        /// Client protocol version, use `PROTOCOL_VERSION`
        version: String,
        /// TERM value for the shell environment
        term: String,
        /// Current client terminal geometry
        size: TermSize,
    },

    /// Daemon's answer to `ResumeRequest`
    ResumeResponse {
        /// Whether the session exists and the attach is accepted
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
        /// Daemon's receive cursor; the client replays from here
        recv_cursor: u64,
    },

    /// Terminal geometry change (client to daemon, channel-independent)
    Resize(TermSize),

    /// Shell exited; the session is torn down after this frame
    SessionEnd {
        /// Exit code if the shell exited normally
        exit_code: Option<i32>,
    },
}

impl Message {
    /// Get the frame type for this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Message::Data(_) => FrameType::Data,
            Message::Open { .. } => FrameType::Open,
            Message::OpenAck { .. } => FrameType::OpenAck,
            Message::Close => FrameType::Close,
            Message::Ack { .. } => FrameType::Ack,
            Message::Heartbeat { .. } => FrameType::Heartbeat,
            Message::ResumeRequest { .. } => FrameType::ResumeRequest,
            Message::ResumeResponse { .. } => FrameType::ResumeResponse,
            Message::Resize(_) => FrameType::Resize,
            Message::SessionEnd { .. } => FrameType::SessionEnd,
        }
    }

    /// Whether this message occupies the reliable sequenced stream
    pub fn reliable(&self) -> bool {
        self.frame_type().reliable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for frame_type in [
            FrameType::Data,
            FrameType::Open,
            FrameType::OpenAck,
            FrameType::Close,
            FrameType::Ack,
            FrameType::Heartbeat,
            FrameType::ResumeRequest,
            FrameType::ResumeResponse,
            FrameType::Resize,
            FrameType::SessionEnd,
        ] {
            let byte = frame_type.as_u8();
            let recovered = FrameType::from_u8(byte).unwrap();
            assert_eq!(recovered, frame_type);
        }
    }

    #[test]
    fn test_reliable_classification() {
        assert!(FrameType::Data.reliable());
        assert!(FrameType::Open.reliable());
        assert!(FrameType::Close.reliable());
        assert!(FrameType::Resize.reliable());
        assert!(!FrameType::Ack.reliable());
        assert!(!FrameType::Heartbeat.reliable());
        assert!(!FrameType::ResumeRequest.reliable());
        assert!(!FrameType::ResumeResponse.reliable());
    }

    #[test]
    fn test_term_size_default() {
        let size = TermSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
    }
}
