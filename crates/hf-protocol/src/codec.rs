//! Tokio codec for framed protocol messages
//!
//! `Data` payloads are carried verbatim so terminal bytes stay
//! byte-transparent on the wire; every other frame type carries a
//! bincode-encoded [`Message`]. Decoding is resumable across arbitrary
//! transport chunking: a parsed header is kept aside until the full
//! payload has arrived.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_FRAME_PAYLOAD};
use crate::message::{FrameType, Message};

/// A complete frame with routing, ordering, and payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// Reliable-stream offset of the payload (0 for ephemeral frames)
    pub sequence: u64,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel: ChannelId, sequence: u64, message: Message) -> Self {
        Self {
            channel,
            sequence,
            message,
        }
    }

    /// Create an ephemeral (unsequenced) control frame
    pub fn control(message: Message) -> Self {
        debug_assert!(!message.reliable());
        Self {
            channel: ChannelId::CONTROL,
            sequence: 0,
            message,
        }
    }

    /// Number of payload bytes this frame occupies on the wire.
    ///
    /// For reliable frames this is also the amount the sender's sequence
    /// counter advances, so it must be stable across re-encoding.
    pub fn payload_len(&self) -> Result<usize, ProtocolError> {
        match &self.message {
            Message::Data(data) => Ok(data.len()),
            other => Ok(bincode::serialized_size(other)? as usize),
        }
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode a header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        let payload_len = header.payload_length as usize;

        // Wait for the full payload
        if src.len() < payload_len {
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        let message = match header.frame_type {
            FrameType::Data => Message::Data(payload),
            frame_type => {
                let message: Message = bincode::deserialize(&payload)?;
                if message.frame_type() != frame_type {
                    return Err(ProtocolError::MalformedPayload { frame_type });
                }
                message
            }
        };

        Ok(Some(Frame {
            channel: header.channel,
            sequence: header.sequence,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_type = frame.message.frame_type();

        let payload = match &frame.message {
            Message::Data(data) => data.clone(),
            other => bincode::serialize(other)?.into(),
        };

        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let header = FrameHeader::new(
            frame.channel,
            frame_type,
            frame.sequence,
            payload.len() as u32,
        );
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
