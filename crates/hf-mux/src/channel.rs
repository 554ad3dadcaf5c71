//! Channel handles and per-channel state
//!
//! A [`Channel`] is one logical stream inside a session, owned by the
//! task consuming it (the terminal bridge, one forwarded connection).
//! Handles stay valid across any number of transport reconnects: the
//! queues they feed live in the multiplexer, not in the transport.
//!
//! Closing is flush-then-FIN: dropping the send half (or calling
//! `close`) lets the write scheduler drain the channel's remaining
//! queued data and then emit the `Close` frame, so no tail bytes are
//! lost. The peer's own `Close` completes the shutdown.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use hf_protocol::{ChannelId, ChannelKind, ForwardTarget, DATA_CHUNK};

use crate::error::MuxError;
use crate::mux::WriteCmd;

/// Shared state for one channel, kept in the multiplexer's registry
pub(crate) struct ChannelEntry {
    pub(crate) kind: ChannelKind,
    pub(crate) state: Mutex<EntryState>,
}

pub(crate) struct EntryState {
    /// We have emitted our Close frame (or are about to; send half gone)
    pub(crate) local_closed: bool,
    /// The peer sent its Close frame
    pub(crate) remote_closed: bool,
    /// Feeds the consumer; dropped on remote close to signal end-of-stream
    pub(crate) inbound_tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelEntry {
    pub(crate) fn new(kind: ChannelKind, inbound_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            kind,
            state: Mutex::new(EntryState {
                local_closed: false,
                remote_closed: false,
                inbound_tx: Some(inbound_tx),
            }),
        }
    }

    /// Sender for the consumer's inbound queue, if the peer hasn't closed
    pub(crate) fn inbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.state.lock().expect("channel state poisoned").inbound_tx.clone()
    }

    fn send_allowed(&self) -> bool {
        let state = self.state.lock().expect("channel state poisoned");
        !state.local_closed && !state.remote_closed
    }
}

/// Send half of a channel
pub struct ChannelSender {
    id: ChannelId,
    entry: Arc<ChannelEntry>,
    outbound: mpsc::Sender<Bytes>,
}

impl ChannelSender {
    /// This channel's id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Enqueue bytes for ordered delivery to the peer.
    ///
    /// Applies backpressure when the channel queue or the resend buffer
    /// is full. Fails once the channel was closed on either side.
    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        if !self.entry.send_allowed() {
            return Err(MuxError::ChannelClosed);
        }

        // Chunked so the scheduler can interleave channels fairly
        let mut remaining = data;
        while !remaining.is_empty() {
            let take = remaining.len().min(DATA_CHUNK);
            let chunk = remaining.split_to(take);
            self.outbound
                .send(chunk)
                .await
                .map_err(|_| MuxError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Finish sending: remaining queued bytes are flushed, then a Close
    /// frame tells the peer no more data will follow.
    pub fn close(self) {
        // Dropping the queue sender is the close signal; the write
        // scheduler emits Close once the queue drains.
        drop(self.outbound);
    }
}

/// Receive half of a channel
pub struct ChannelReceiver {
    id: ChannelId,
    inbound: mpsc::Receiver<Bytes>,
}

impl ChannelReceiver {
    /// This channel's id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next ordered chunk; `None` is the end-of-stream marker.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

/// One logical stream multiplexed inside a session
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        entry: Arc<ChannelEntry>,
        outbound: mpsc::Sender<Bytes>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            id,
            kind,
            sender: ChannelSender {
                id,
                entry,
                outbound,
            },
            receiver: ChannelReceiver { id, inbound },
        }
    }

    /// This channel's id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// What this channel carries
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Enqueue bytes for ordered delivery to the peer
    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        self.sender.send(data).await
    }

    /// Next ordered chunk; `None` is the end-of-stream marker
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Split into independent send/receive halves so two tasks can
    /// bridge each direction
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    /// Flush queued data, then close the channel
    pub fn close(self) {
        self.sender.close();
    }
}

/// A channel the peer asked to open.
///
/// The inbound queue already exists, so data arriving before the
/// decision is buffered rather than lost. `accept` acknowledges the
/// open and yields the channel; `reject` refuses it.
pub struct IncomingChannel {
    channel: Channel,
    target: Option<ForwardTarget>,
    control_tx: mpsc::Sender<WriteCmd>,
}

impl IncomingChannel {
    pub(crate) fn new(
        channel: Channel,
        target: Option<ForwardTarget>,
        control_tx: mpsc::Sender<WriteCmd>,
    ) -> Self {
        Self {
            channel,
            target,
            control_tx,
        }
    }

    /// What the initiator wants this channel to carry
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    /// Connect target for forwarded-port channels
    pub fn target(&self) -> Option<&ForwardTarget> {
        self.target.as_ref()
    }

    /// Accept the open and take ownership of the channel
    pub async fn accept(self) -> Result<Channel, MuxError> {
        self.control_tx
            .send(WriteCmd::OpenAck {
                id: self.channel.id(),
                accepted: true,
                reason: None,
            })
            .await
            .map_err(|_| MuxError::SessionDown)?;
        Ok(self.channel)
    }

    /// Refuse the open; the initiator's `open_channel` call fails with
    /// the given reason
    pub async fn reject(self, reason: impl Into<String>) -> Result<(), MuxError> {
        let id = self.channel.id();
        // Deregister before the handles drop so the scheduler does not
        // mistake the drained queue for a graceful close
        self.control_tx
            .send(WriteCmd::Deregister { id })
            .await
            .map_err(|_| MuxError::SessionDown)?;
        self.control_tx
            .send(WriteCmd::OpenAck {
                id,
                accepted: false,
                reason: Some(reason.into()),
            })
            .await
            .map_err(|_| MuxError::SessionDown)?;
        Ok(())
    }
}
