//! Frame header encoding/decoding
//!
//! The frame format uses a 17-byte header:
//! - channel_id: 4 bytes (u32, big-endian)
//! - frame_type: 1 byte (u8)
//! - sequence: 8 bytes (u64, big-endian): offset of the first payload
//!   byte in the direction's reliable stream; 0 for ephemeral frames
//! - payload_length: 4 bytes (u32, big-endian)

use bytes::{Buf, BufMut, BytesMut};

use crate::channel::ChannelId;
use crate::error::ProtocolError;
use crate::message::FrameType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 17;

/// Maximum payload size for a single frame (1 MiB)
pub const MAX_FRAME_PAYLOAD: usize = 0x0010_0000;

/// Maximum bytes of channel data carried per Data frame.
///
/// Keeping data frames small lets the write scheduler interleave channels
/// fairly; a bulk forwarded transfer never occupies the transport for more
/// than one chunk at a time.
pub const DATA_CHUNK: usize = 16 * 1024;

/// Frame header containing routing, ordering, and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel this frame belongs to
    pub channel: ChannelId,
    /// Type of the payload
    pub frame_type: FrameType,
    /// Reliable-stream offset of the payload (0 for ephemeral frames)
    pub sequence: u64,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(
        channel: ChannelId,
        frame_type: FrameType,
        sequence: u64,
        payload_length: u32,
    ) -> Self {
        Self {
            channel,
            frame_type,
            sequence,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.channel.as_u32());
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u64(self.sequence);
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer.
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown frame type or
    /// oversize payload); the transport carrying it must be dropped.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the type byte first to validate before consuming
        let type_byte = src[4];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(ProtocolError::UnknownFrameType(type_byte))?;

        let channel = ChannelId::new(src.get_u32());
        let _ = src.get_u8(); // frame_type already parsed
        let sequence = src.get_u64();
        let payload_length = src.get_u32();

        if payload_length as usize > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        Ok(Some(Self {
            channel,
            frame_type,
            sequence,
            payload_length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(ChannelId::new(42), FrameType::Data, 9001, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE - 1][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
        // Nothing consumed while waiting for more data
        assert_eq!(buf.len(), HEADER_SIZE - 1);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xFE);
        buf.put_u64(0);
        buf.put_u32(10);

        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameType(0xFE))));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data.as_u8());
        buf.put_u64(0);
        buf.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);

        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
