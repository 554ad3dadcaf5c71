//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations.
///
/// A protocol error is fatal for the transport it occurred on, never for
/// the session: the caller drops the transport and reconnects.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown frame type byte
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload did not match the frame type it was declared as
    #[error("Malformed {frame_type:?} payload")]
    MalformedPayload {
        frame_type: crate::message::FrameType,
    },

    /// A control frame arrived where only a handshake frame is valid
    #[error("Unexpected frame during handshake: {0:?}")]
    UnexpectedFrame(crate::message::FrameType),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
