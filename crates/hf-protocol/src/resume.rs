//! Per-direction delivery bookkeeping for the resumption protocol
//!
//! Each direction of a session carries one reliable byte stream: the
//! payload bytes of reliable frames, counted in emission order across all
//! channels. The sender retains every reliable frame until the peer
//! acknowledges its bytes; after a transport is replaced, the sender
//! replays exactly the retained frames above the peer's receive cursor and
//! the receiver drops anything it has already delivered. Together these
//! give exactly-once, in-order delivery across any number of reconnects.

use std::collections::{BTreeMap, VecDeque};

use crate::channel::ChannelId;
use crate::codec::Frame;
use crate::error::ProtocolError;
use crate::message::Message;

/// Sequence assignment for one direction's reliable stream
#[derive(Debug, Default)]
pub struct SendState {
    next_seq: u64,
}

impl SendState {
    /// Start a fresh stream at offset zero
    pub fn new() -> Self {
        Self { next_seq: 0 }
    }

    /// Offset the next reliable payload byte will occupy
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Assign a sequence to a payload of the given length and advance
    pub fn assign(&mut self, payload_len: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += payload_len as u64;
        seq
    }
}

/// One reliable frame retained for possible replay
#[derive(Debug, Clone)]
pub struct RetainedFrame {
    /// Stream offset of the first payload byte
    pub sequence: u64,
    /// Channel the frame belongs to
    pub channel: ChannelId,
    /// The payload
    pub message: Message,
    /// Payload length on the wire
    payload_len: usize,
}

impl RetainedFrame {
    /// Offset one past the last payload byte
    pub fn end(&self) -> u64 {
        self.sequence + self.payload_len as u64
    }
}

/// Ordered reliable frames not yet acknowledged by the peer.
///
/// Bounded by `max_retained_bytes`: the write scheduler checks
/// [`ResendBuffer::has_room`] before pulling more channel data, so
/// unacknowledged bytes never grow past the cap while control frames keep
/// flowing.
#[derive(Debug)]
pub struct ResendBuffer {
    frames: VecDeque<RetainedFrame>,
    retained_bytes: usize,
    max_retained_bytes: usize,
    acked: u64,
}

impl ResendBuffer {
    /// Create a buffer bounded to `max_retained_bytes` of payload
    pub fn new(max_retained_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            retained_bytes: 0,
            max_retained_bytes,
            acked: 0,
        }
    }

    /// Retain a reliable frame after it was assigned a sequence.
    ///
    /// Frames must arrive in sequence order; the caller is the single
    /// task that owns this direction's sequence counter.
    pub fn retain(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        debug_assert!(frame.message.reliable());
        let payload_len = frame.payload_len()?;

        if let Some(last) = self.frames.back() {
            debug_assert_eq!(last.end(), frame.sequence);
        }

        self.retained_bytes += payload_len;
        self.frames.push_back(RetainedFrame {
            sequence: frame.sequence,
            channel: frame.channel,
            message: frame.message.clone(),
            payload_len,
        });
        Ok(())
    }

    /// Process a peer acknowledgment: evict every frame wholly below
    /// `offset`. Returns the number of payload bytes released.
    ///
    /// Stale or duplicate acks (offset at or below the current ack) are
    /// no-ops; acks never move backwards.
    pub fn ack(&mut self, offset: u64) -> usize {
        if offset <= self.acked {
            return 0;
        }
        self.acked = offset;

        let mut released = 0;
        while let Some(front) = self.frames.front() {
            if front.end() <= offset {
                released += front.payload_len;
                self.frames.pop_front();
            } else {
                break;
            }
        }
        self.retained_bytes -= released;
        released
    }

    /// Frames to replay after a transport replacement, starting at the
    /// peer's receive cursor.
    ///
    /// Acks are emitted at frame boundaries, so `offset` normally falls
    /// exactly between frames; a `Data` frame straddling the cursor is
    /// trimmed so no byte is sent twice.
    pub fn replay_from(&self, offset: u64) -> Vec<Frame> {
        let mut out = Vec::new();
        for retained in &self.frames {
            if retained.end() <= offset {
                continue;
            }
            if retained.sequence >= offset {
                out.push(Frame::new(
                    retained.channel,
                    retained.sequence,
                    retained.message.clone(),
                ));
                continue;
            }
            // Straddling frame: only Data can be split
            let skip = (offset - retained.sequence) as usize;
            match &retained.message {
                Message::Data(data) => out.push(Frame::new(
                    retained.channel,
                    offset,
                    Message::Data(data.slice(skip..)),
                )),
                other => out.push(Frame::new(
                    retained.channel,
                    retained.sequence,
                    other.clone(),
                )),
            }
        }
        out
    }

    /// Payload bytes currently retained
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Whether `additional` more payload bytes fit under the cap
    pub fn has_room(&self, additional: usize) -> bool {
        self.retained_bytes + additional <= self.max_retained_bytes
    }

    /// Highest acknowledged offset seen so far
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// True when every retained byte has been acknowledged
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Receive-side cursor with reordering for the transient window around a
/// reconnect.
///
/// Frames at or below the cursor are duplicates from a replay and are
/// dropped (or trimmed, for a straddling `Data` frame). Frames ahead of
/// the cursor are parked and delivered once the gap fills; consumers
/// therefore never observe out-of-order bytes.
///
/// The cursor here tracks what has been *surfaced* for delivery; the
/// caller acknowledges to the peer only what its consumers actually
/// received, and calls [`Reassembly::rewind`] to that offset when a
/// transport is replaced, so a delivery interrupted mid-hand-off is
/// re-requested instead of silently dropped.
#[derive(Debug)]
pub struct Reassembly {
    cursor: u64,
    parked: BTreeMap<u64, Frame>,
}

impl Reassembly {
    /// Start a fresh stream at offset zero
    pub fn new() -> Self {
        Self {
            cursor: 0,
            parked: BTreeMap::new(),
        }
    }

    /// Offset below which everything has been surfaced for delivery
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Move the cursor back to `to`, the highest offset actually handed
    /// to consumers. Called when a transport is replaced: the peer
    /// replays from `to`, and everything in between is delivered again.
    pub fn rewind(&mut self, to: u64) {
        debug_assert!(to <= self.cursor);
        self.cursor = to;
    }

    /// Offer a reliable frame; returns the messages now ready for
    /// delivery, in stream order, each with the stream offset reached
    /// once it is delivered.
    pub fn offer(
        &mut self,
        frame: Frame,
    ) -> Result<Vec<(ChannelId, Message, u64)>, ProtocolError> {
        let mut ready = Vec::new();

        if frame.sequence > self.cursor {
            // Gap ahead of us; park until the missing bytes arrive
            tracing::debug!(
                seq = frame.sequence,
                cursor = self.cursor,
                "parking out-of-order frame"
            );
            self.parked.insert(frame.sequence, frame);
            return Ok(ready);
        }

        self.accept(frame, &mut ready)?;

        // Drain parked frames that have become contiguous
        while let Some((&seq, _)) = self.parked.first_key_value() {
            if seq > self.cursor {
                break;
            }
            let (_, parked) = self.parked.pop_first().expect("checked non-empty");
            self.accept(parked, &mut ready)?;
        }

        Ok(ready)
    }

    fn accept(
        &mut self,
        frame: Frame,
        ready: &mut Vec<(ChannelId, Message, u64)>,
    ) -> Result<(), ProtocolError> {
        let len = frame.payload_len()? as u64;
        let end = frame.sequence + len;

        if end <= self.cursor {
            // Fully replayed duplicate
            return Ok(());
        }

        if frame.sequence >= self.cursor {
            self.cursor = end;
            ready.push((frame.channel, frame.message, end));
            return Ok(());
        }

        // Straddling frame: drop the already-delivered prefix of Data;
        // control payloads are indivisible and delivered whole.
        let skip = (self.cursor - frame.sequence) as usize;
        self.cursor = end;
        match frame.message {
            Message::Data(data) => {
                ready.push((frame.channel, Message::Data(data.slice(skip..)), end))
            }
            other => ready.push((frame.channel, other, end)),
        }
        Ok(())
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data_frame(seq_state: &mut SendState, channel: u32, payload: &'static [u8]) -> Frame {
        let seq = seq_state.assign(payload.len());
        Frame::new(
            ChannelId::new(channel),
            seq,
            Message::Data(Bytes::from_static(payload)),
        )
    }

    #[test]
    fn test_ack_evicts_below_offset() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(1024);

        let a = data_frame(&mut send, 1, b"hello");
        let b = data_frame(&mut send, 1, b"world");
        buffer.retain(&a).unwrap();
        buffer.retain(&b).unwrap();
        assert_eq!(buffer.retained_bytes(), 10);

        let released = buffer.ack(5);
        assert_eq!(released, 5);
        assert_eq!(buffer.retained_bytes(), 5);

        // No retained bytes below the acknowledged offset
        for frame in buffer.replay_from(0) {
            assert!(frame.sequence >= 5);
        }

        buffer.ack(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_stale_ack_is_noop() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(1024);
        buffer.retain(&data_frame(&mut send, 1, b"abcde")).unwrap();

        assert_eq!(buffer.ack(5), 5);
        assert_eq!(buffer.ack(3), 0);
        assert_eq!(buffer.ack(5), 0);
        assert_eq!(buffer.acked(), 5);
    }

    #[test]
    fn test_replay_trims_straddling_data() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(1024);
        buffer.retain(&data_frame(&mut send, 1, b"abcdef")).unwrap();

        let replay = buffer.replay_from(2);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].sequence, 2);
        match &replay[0].message {
            Message::Data(data) => assert_eq!(data.as_ref(), b"cdef"),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_from_zero_returns_everything() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(1024);
        buffer.retain(&data_frame(&mut send, 1, b"one")).unwrap();
        buffer.retain(&data_frame(&mut send, 2, b"two")).unwrap();

        let replay = buffer.replay_from(0);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].channel, ChannelId::new(1));
        assert_eq!(replay[1].channel, ChannelId::new(2));
    }

    #[test]
    fn test_capacity_accounting() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(8);
        buffer.retain(&data_frame(&mut send, 1, b"abcd")).unwrap();

        assert!(buffer.has_room(4));
        assert!(!buffer.has_room(5));
        buffer.ack(4);
        assert!(buffer.has_room(8));
    }

    #[test]
    fn test_reassembly_duplicate_dropped() {
        let mut reasm = Reassembly::new();
        let frame = Frame::new(
            ChannelId::TERMINAL,
            0,
            Message::Data(Bytes::from_static(b"hi\n")),
        );

        let first = reasm.offer(frame.clone()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(reasm.cursor(), 3);

        // Replay of the same frame after a reconnect: exactly once
        let second = reasm.offer(frame).unwrap();
        assert!(second.is_empty());
        assert_eq!(reasm.cursor(), 3);
    }

    #[test]
    fn test_reassembly_trims_straddling_data() {
        let mut reasm = Reassembly::new();
        reasm
            .offer(Frame::new(
                ChannelId::TERMINAL,
                0,
                Message::Data(Bytes::from_static(b"abcd")),
            ))
            .unwrap();

        // Peer replayed from an older ack; first two bytes already seen
        let ready = reasm
            .offer(Frame::new(
                ChannelId::TERMINAL,
                2,
                Message::Data(Bytes::from_static(b"cdEF")),
            ))
            .unwrap();

        assert_eq!(ready.len(), 1);
        match &ready[0].1 {
            Message::Data(data) => assert_eq!(data.as_ref(), b"EF"),
            other => panic!("expected Data, got {:?}", other),
        }
        assert_eq!(reasm.cursor(), 6);
    }

    #[test]
    fn test_reassembly_rewind_redelivers_exactly_once() {
        let mut reasm = Reassembly::new();
        let frame = Frame::new(
            ChannelId::TERMINAL,
            0,
            Message::Data(Bytes::from_static(b"hi\n")),
        );

        // Surfaced but the hand-off was interrupted before delivery
        let ready = reasm.offer(frame.clone()).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].2, 3);

        // New transport: rewind to what was actually delivered (nothing)
        reasm.rewind(0);

        // Peer replays; the bytes surface again, exactly once
        let ready = reasm.offer(frame.clone()).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(reasm.cursor(), 3);

        // A second replay is now a duplicate
        assert!(reasm.offer(frame).unwrap().is_empty());
    }

    #[test]
    fn test_reassembly_reorders_gap() {
        let mut reasm = Reassembly::new();

        // Frame ahead of the cursor arrives first
        let early = reasm
            .offer(Frame::new(
                ChannelId::TERMINAL,
                3,
                Message::Data(Bytes::from_static(b"def")),
            ))
            .unwrap();
        assert!(early.is_empty());
        assert_eq!(reasm.cursor(), 0);

        // Gap fills; both frames deliver in order
        let ready = reasm
            .offer(Frame::new(
                ChannelId::TERMINAL,
                0,
                Message::Data(Bytes::from_static(b"abc")),
            ))
            .unwrap();
        assert_eq!(ready.len(), 2);
        match (&ready[0].1, &ready[1].1) {
            (Message::Data(a), Message::Data(b)) => {
                assert_eq!(a.as_ref(), b"abc");
                assert_eq!(b.as_ref(), b"def");
            }
            _ => panic!("expected two Data messages"),
        }
        assert_eq!(reasm.cursor(), 6);
    }

    #[test]
    fn test_control_frames_share_the_stream() {
        let mut send = SendState::new();
        let mut buffer = ResendBuffer::new(1024);

        let open_msg = Message::Open {
            kind: crate::message::ChannelKind::ForwardedPort,
            target: None,
        };
        let open_len = Frame::new(ChannelId::new(2), 0, open_msg.clone())
            .payload_len()
            .unwrap();
        let open = Frame::new(ChannelId::new(2), send.assign(open_len), open_msg);
        buffer.retain(&open).unwrap();

        let data = data_frame(&mut send, 2, b"payload");
        buffer.retain(&data).unwrap();
        assert!(data.sequence > 0);

        // Replay preserves the open-before-data ordering
        let replay = buffer.replay_from(0);
        assert!(matches!(replay[0].message, Message::Open { .. }));
        assert!(matches!(replay[1].message, Message::Data(_)));
    }
}
