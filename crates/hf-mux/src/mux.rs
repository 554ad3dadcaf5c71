//! The channel multiplexer
//!
//! One [`Mux`] exists per side per session and outlives every transport.
//! [`Mux::run`] drives a single transport: a read task routes incoming
//! frames to per-channel queues, and a write scheduler drains outgoing
//! queues round-robin onto the wire, maintaining the resend buffer the
//! resumption protocol replays from. When `run` returns, the session
//! state (channels, queues, cursors, resend buffer) is intact and the
//! next transport picks up where this one stopped.
//!
//! Task model per bound transport:
//! - read loop: decode frames, dedup/reorder against the receive cursor,
//!   dispatch to channel queues, detect silence past the grace interval
//! - write loop: round-robin channel queues, control commands, acks on
//!   cursor advance, heartbeats on outgoing silence
//!
//! The resend buffer and send sequence are touched only by the write
//! loop; the receive cursor only by the read loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::poll_fn;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hf_core::time::current_time_millis;
use hf_core::Transport;
use hf_protocol::{
    ChannelId, ChannelKind, ForwardTarget, Frame, FrameCodec, Message, ProtocolError, Reassembly,
    ResendBuffer, SendState, TermSize, DATA_CHUNK,
};

use crate::channel::{Channel, ChannelEntry, IncomingChannel};
use crate::error::{Disconnect, MuxError};

/// Capacity of the write-command queue between handles and the scheduler
const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Capacity of the event queue toward the session owner
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Which side of the session this multiplexer serves.
///
/// Determines the channel-id allocation space: the client takes even
/// ids, the session daemon odd ids, so both can open channels
/// concurrently without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Local reconnect controller
    Client,
    /// Remote session daemon
    Server,
}

/// Multiplexer tuning, derived from the client or session config
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Emit a heartbeat after this much outgoing silence
    pub heartbeat_interval: Duration,
    /// Declare the transport lost after this much incoming silence
    pub grace_interval: Duration,
    /// Maximum unacknowledged bytes retained for replay
    pub resend_buffer_bytes: usize,
    /// Chunks buffered per channel before senders block
    pub queue_depth: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            grace_interval: Duration::from_secs(20),
            resend_buffer_bytes: 8 * 1024 * 1024,
            queue_depth: 32,
        }
    }
}

/// Events surfaced to the session owner
pub enum MuxEvent {
    /// The peer asked to open a channel
    Incoming(IncomingChannel),
    /// The peer's terminal geometry changed (daemon side)
    Resize(TermSize),
}

/// Commands from channel handles and the read loop to the write scheduler
pub(crate) enum WriteCmd {
    /// Attach a channel's outbound queue to the scheduler
    Register {
        id: ChannelId,
        rx: mpsc::Receiver<Bytes>,
    },
    /// Detach a queue without emitting Close (rejected opens)
    Deregister { id: ChannelId },
    /// Emit an Open frame for a locally allocated channel
    Open {
        id: ChannelId,
        kind: ChannelKind,
        target: Option<ForwardTarget>,
    },
    /// Answer a peer's Open
    OpenAck {
        id: ChannelId,
        accepted: bool,
        reason: Option<String>,
    },
    /// Announce new terminal geometry (client side)
    Resize(TermSize),
    /// Announce shell exit and end the session (daemon side)
    SessionEnd { exit_code: Option<i32> },
}

struct ChannelQueue {
    id: ChannelId,
    rx: mpsc::Receiver<Bytes>,
}

enum QueueEvent {
    /// A channel produced a chunk
    Chunk(ChannelId, Bytes),
    /// A channel's send half dropped and its queue drained: time to Close
    Drained(ChannelId),
}

/// State owned by the write scheduler, persistent across transports
struct WriterState {
    control_rx: mpsc::Receiver<WriteCmd>,
    queues: Vec<ChannelQueue>,
    rr_cursor: usize,
    send: SendState,
    resend: ResendBuffer,
    last_tx: Instant,
}

struct Shared {
    side: Side,
    config: MuxConfig,
    registry: DashMap<ChannelId, Arc<ChannelEntry>>,
    control_tx: mpsc::Sender<WriteCmd>,
    events_tx: mpsc::Sender<MuxEvent>,
    pending_opens: DashMap<ChannelId, oneshot::Sender<Result<(), String>>>,
    next_channel_id: AtomicU32,
    /// Receive cursor, published by the read loop
    recv_cursor: watch::Sender<u64>,
    /// Peer's acknowledged offset, published by the read loop
    peer_ack: watch::Sender<u64>,
    /// Arrival time of the most recent frame on the bound transport
    last_rx: std::sync::Mutex<Instant>,
}

/// The channel multiplexer for one session
pub struct Mux {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriterState>,
    reader: tokio::sync::Mutex<Reassembly>,
    terminal: std::sync::Mutex<Option<Channel>>,
}

impl Mux {
    /// Create a multiplexer and its event stream.
    ///
    /// The terminal channel is created implicitly and retrieved once via
    /// [`Mux::take_terminal`]; it needs no open handshake.
    pub fn new(side: Side, config: MuxConfig) -> (Self, mpsc::Receiver<MuxEvent>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let resend = ResendBuffer::new(config.resend_buffer_bytes);
        let queue_depth = config.queue_depth;

        let shared = Arc::new(Shared {
            side,
            config,
            registry: DashMap::new(),
            control_tx,
            events_tx,
            pending_opens: DashMap::new(),
            next_channel_id: AtomicU32::new(match side {
                Side::Client => 2,
                Side::Server => 3,
            }),
            recv_cursor: watch::channel(0).0,
            peer_ack: watch::channel(0).0,
            last_rx: std::sync::Mutex::new(Instant::now()),
        });

        // Terminal channel plumbing, implicitly open at session start
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_depth);
        let entry = Arc::new(ChannelEntry::new(ChannelKind::Terminal, inbound_tx));
        shared.registry.insert(ChannelId::TERMINAL, Arc::clone(&entry));
        let terminal = Channel::new(
            ChannelId::TERMINAL,
            ChannelKind::Terminal,
            entry,
            outbound_tx,
            inbound_rx,
        );

        let writer = WriterState {
            control_rx,
            queues: vec![ChannelQueue {
                id: ChannelId::TERMINAL,
                rx: outbound_rx,
            }],
            rr_cursor: 0,
            send: SendState::new(),
            resend,
            last_tx: Instant::now(),
        };

        let mux = Self {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(Reassembly::new()),
            terminal: std::sync::Mutex::new(Some(terminal)),
        };

        (mux, events_rx)
    }

    /// Take the terminal channel handle (available exactly once)
    pub fn take_terminal(&self) -> Option<Channel> {
        self.terminal.lock().expect("terminal lock poisoned").take()
    }

    /// Receive cursor for the resumption handshake
    pub fn recv_cursor(&self) -> u64 {
        *self.shared.recv_cursor.borrow()
    }

    /// Open a channel toward the peer.
    ///
    /// Emits an `Open` frame and resolves once the peer answers. The
    /// open itself rides the reliable stream, so a transport drop while
    /// waiting delays the answer rather than losing the request.
    pub async fn open_channel(
        &self,
        kind: ChannelKind,
        target: Option<ForwardTarget>,
    ) -> Result<Channel, MuxError> {
        let id = ChannelId::new(self.shared.next_channel_id.fetch_add(2, Ordering::SeqCst));

        let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.shared.config.queue_depth);
        let entry = Arc::new(ChannelEntry::new(kind, inbound_tx));
        self.shared.registry.insert(id, Arc::clone(&entry));

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending_opens.insert(id, ack_tx);

        let sent = self
            .shared
            .control_tx
            .send(WriteCmd::Register {
                id,
                rx: outbound_rx,
            })
            .await
            .and(
                self.shared
                    .control_tx
                    .send(WriteCmd::Open { id, kind, target })
                    .await,
            );
        if sent.is_err() {
            self.shared.registry.remove(&id);
            self.shared.pending_opens.remove(&id);
            return Err(MuxError::SessionDown);
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(Channel::new(id, kind, entry, outbound_tx, inbound_rx)),
            Ok(Err(reason)) => Err(MuxError::OpenRejected { reason }),
            Err(_) => Err(MuxError::SessionDown),
        }
    }

    /// Announce new terminal geometry to the peer (client side)
    pub async fn send_resize(&self, size: TermSize) -> Result<(), MuxError> {
        self.shared
            .control_tx
            .send(WriteCmd::Resize(size))
            .await
            .map_err(|_| MuxError::SessionDown)
    }

    /// Announce shell exit to the peer (daemon side).
    ///
    /// The frame is reliable: if no transport is bound it waits in the
    /// resend buffer and is replayed on the next attach.
    pub async fn send_session_end(&self, exit_code: Option<i32>) -> Result<(), MuxError> {
        self.shared
            .control_tx
            .send(WriteCmd::SessionEnd { exit_code })
            .await
            .map_err(|_| MuxError::SessionDown)
    }

    /// Drive one transport until it is lost, violated, cancelled, or the
    /// session ends.
    ///
    /// `replay_from` is the peer's receive cursor from the resumption
    /// handshake: everything retained above it is replayed first.
    /// Binding waits for the previous binding's write scheduler to
    /// release its state, so a superseding transport never interleaves
    /// writes with the one it replaces.
    pub async fn run<T: Transport>(
        &self,
        framed: Framed<T, FrameCodec>,
        replay_from: u64,
        cancel: CancellationToken,
    ) -> Disconnect {
        let (sink, stream) = framed.split();

        let mut writer = self.writer.lock().await;
        let mut reasm = self.reader.lock().await;
        // A previous binding may have been torn down between surfacing a
        // message and handing it to its consumer; the peer replays from
        // the delivered offset, so re-surface everything past it
        reasm.rewind(*self.shared.recv_cursor.borrow());
        *self.shared.last_rx.lock().expect("last_rx poisoned") = Instant::now();

        tokio::select! {
            disconnect = read_loop(&self.shared, &mut reasm, stream, &cancel) => disconnect,
            disconnect = write_loop(&self.shared, &mut writer, sink, replay_from, &cancel) => disconnect,
        }
    }

    /// Which side this multiplexer serves
    pub fn side(&self) -> Side {
        self.shared.side
    }
}

fn lost(err: ProtocolError) -> Disconnect {
    match err {
        ProtocolError::Io(io) => Disconnect::TransportLost(io.to_string()),
        err => Disconnect::ProtocolViolation(err),
    }
}

async fn read_loop<T: Transport>(
    shared: &Arc<Shared>,
    reasm: &mut Reassembly,
    mut stream: SplitStream<Framed<T, FrameCodec>>,
    cancel: &CancellationToken,
) -> Disconnect {
    let mut grace_check = tokio::time::interval(Duration::from_secs(1).min(shared.config.grace_interval));
    grace_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        // biased: drain available frames before consulting the grace
        // timer, so queued traffic is never misread as silence
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Disconnect::Cancelled,
            frame = stream.next() => match frame {
                None => return Disconnect::TransportLost("transport closed".to_string()),
                Some(Err(err)) => return lost(err),
                Some(Ok(frame)) => {
                    if let Some(disconnect) = handle_frame(shared, reasm, frame).await {
                        return disconnect;
                    }
                }
            },
            _ = grace_check.tick() => {
                let silent = shared.last_rx.lock().expect("last_rx poisoned").elapsed();
                if silent > shared.config.grace_interval {
                    return Disconnect::TransportLost(format!(
                        "no frames for {:.0?} (grace {:.0?})",
                        silent, shared.config.grace_interval
                    ));
                }
            }
        }
    }
}

async fn handle_frame(
    shared: &Arc<Shared>,
    reasm: &mut Reassembly,
    frame: Frame,
) -> Option<Disconnect> {
    *shared.last_rx.lock().expect("last_rx poisoned") = Instant::now();

    match &frame.message {
        Message::Ack { offset } => {
            let offset = *offset;
            shared.peer_ack.send_if_modified(|current| {
                if offset > *current {
                    *current = offset;
                    true
                } else {
                    false
                }
            });
            None
        }
        Message::Heartbeat { .. } => None,
        Message::ResumeRequest { .. } | Message::ResumeResponse { .. } => {
            // Handshake frames are only valid before the transport is bound
            Some(Disconnect::ProtocolViolation(ProtocolError::UnexpectedFrame(
                frame.message.frame_type(),
            )))
        }
        _ => {
            let ready = match reasm.offer(frame) {
                Ok(ready) => ready,
                Err(err) => return Some(Disconnect::ProtocolViolation(err)),
            };
            // The cursor is committed per message, after its consumer
            // hand-off: what we acknowledge is what was delivered
            for (channel, message, end) in ready {
                if let Some(disconnect) = dispatch(shared, channel, message).await {
                    return Some(disconnect);
                }
                shared.recv_cursor.send_replace(end);
            }
            None
        }
    }
}

async fn dispatch(
    shared: &Arc<Shared>,
    channel: ChannelId,
    message: Message,
) -> Option<Disconnect> {
    match message {
        Message::Data(data) => {
            let sender = shared
                .registry
                .get(&channel)
                .and_then(|entry| entry.inbound_sender());
            match sender {
                // Consumer gone mid-close: the tail is discarded, which
                // matches a locally closed channel
                Some(tx) => {
                    let _ = tx.send(data).await;
                }
                None => tracing::trace!("dropping data for closed {}", channel),
            }
            None
        }

        Message::Open { kind, target } => {
            if shared.registry.contains_key(&channel) {
                tracing::warn!("peer reopened existing {}", channel);
                return None;
            }
            let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.queue_depth);
            let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.queue_depth);
            let entry = Arc::new(ChannelEntry::new(kind, inbound_tx));
            shared.registry.insert(channel, Arc::clone(&entry));

            if shared
                .control_tx
                .send(WriteCmd::Register {
                    id: channel,
                    rx: outbound_rx,
                })
                .await
                .is_err()
            {
                return Some(Disconnect::Cancelled);
            }

            let incoming = IncomingChannel::new(
                Channel::new(channel, kind, entry, outbound_tx, inbound_rx),
                target,
                shared.control_tx.clone(),
            );
            if shared
                .events_tx
                .send(MuxEvent::Incoming(incoming))
                .await
                .is_err()
            {
                tracing::warn!("no listener for incoming {}; dropping open", channel);
                shared.registry.remove(&channel);
            }
            None
        }

        Message::OpenAck { accepted, reason } => {
            if let Some((_, ack_tx)) = shared.pending_opens.remove(&channel) {
                if accepted {
                    let _ = ack_tx.send(Ok(()));
                } else {
                    shared.registry.remove(&channel);
                    let _ = shared.control_tx.send(WriteCmd::Deregister { id: channel }).await;
                    let _ = ack_tx.send(Err(reason.unwrap_or_else(|| "rejected by peer".to_string())));
                }
            } else {
                tracing::warn!("OpenAck for unknown pending open on {}", channel);
            }
            None
        }

        Message::Close => {
            let fully_closed = match shared.registry.get(&channel) {
                Some(entry) => {
                    let mut state = entry.state.lock().expect("channel state poisoned");
                    state.remote_closed = true;
                    // Dropping the inbound sender delivers end-of-stream
                    // to the consumer once the queue drains
                    state.inbound_tx = None;
                    state.local_closed
                }
                None => {
                    tracing::trace!("Close for unknown {}", channel);
                    return None;
                }
            };
            if fully_closed {
                shared.registry.remove(&channel);
            }
            None
        }

        Message::Resize(size) => {
            let _ = shared.events_tx.send(MuxEvent::Resize(size)).await;
            None
        }

        Message::SessionEnd { exit_code } => Some(Disconnect::SessionEnded { exit_code }),

        Message::Ack { .. }
        | Message::Heartbeat { .. }
        | Message::ResumeRequest { .. }
        | Message::ResumeResponse { .. } => unreachable!("ephemeral frames never reach dispatch"),
    }
}

/// Poll the channel queues starting at the round-robin cursor.
///
/// Returns the first queue with a chunk ready (advancing the cursor past
/// it, so a busy channel cannot starve the others) or a drained queue
/// whose senders all dropped.
fn poll_queues(
    cx: &mut Context<'_>,
    queues: &mut Vec<ChannelQueue>,
    rr_cursor: &mut usize,
) -> Poll<QueueEvent> {
    if queues.is_empty() {
        return Poll::Pending;
    }
    let len = queues.len();
    for step in 0..len {
        let idx = (*rr_cursor + step) % len;
        match queues[idx].rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => {
                *rr_cursor = (idx + 1) % len;
                return Poll::Ready(QueueEvent::Chunk(queues[idx].id, bytes));
            }
            Poll::Ready(None) => {
                *rr_cursor = (idx + 1) % len;
                return Poll::Ready(QueueEvent::Drained(queues[idx].id));
            }
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

enum WriteWork {
    Cancelled,
    PeerAck,
    SendAck(u64),
    Cmd(Option<WriteCmd>),
    Queue(QueueEvent),
    Tick,
}

async fn write_loop<T: Transport>(
    shared: &Arc<Shared>,
    w: &mut WriterState,
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    replay_from: u64,
    cancel: &CancellationToken,
) -> Disconnect {
    // The handshake cursor doubles as an acknowledgment: purge below it,
    // then replay exactly the unacknowledged remainder
    w.resend.ack(replay_from);
    shared.peer_ack.send_if_modified(|current| {
        if replay_from > *current {
            *current = replay_from;
            true
        } else {
            false
        }
    });
    for frame in w.resend.replay_from(replay_from) {
        tracing::debug!(seq = frame.sequence, channel = %frame.channel, "replaying frame");
        if let Err(err) = sink.send(frame).await {
            return lost(err);
        }
    }

    // Tell the peer our cursor immediately so its replay buffer purges
    // without waiting for new traffic
    let cursor = *shared.recv_cursor.borrow();
    if let Err(err) = sink.send(Frame::control(Message::Ack { offset: cursor })).await {
        return lost(err);
    }

    let mut peer_ack_rx = shared.peer_ack.subscribe();
    let mut cursor_rx = shared.recv_cursor.subscribe();
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    w.last_tx = Instant::now();

    loop {
        // Backpressure: stop pulling channel data while the resend
        // buffer is at capacity; acks re-enable the queue arm
        let room = w.resend.has_room(DATA_CHUNK);

        let control_rx = &mut w.control_rx;
        let queues = &mut w.queues;
        let rr_cursor = &mut w.rr_cursor;

        let work = tokio::select! {
            biased;
            _ = cancel.cancelled() => WriteWork::Cancelled,
            Ok(()) = peer_ack_rx.changed() => WriteWork::PeerAck,
            Ok(()) = cursor_rx.changed() => WriteWork::SendAck(*cursor_rx.borrow_and_update()),
            cmd = control_rx.recv() => WriteWork::Cmd(cmd),
            event = poll_fn(|cx| poll_queues(cx, queues, rr_cursor)), if room => WriteWork::Queue(event),
            _ = ticker.tick() => WriteWork::Tick,
        };

        let result = match work {
            WriteWork::Cancelled => return Disconnect::Cancelled,

            WriteWork::PeerAck => {
                let offset = *peer_ack_rx.borrow_and_update();
                let released = w.resend.ack(offset);
                if released > 0 {
                    tracing::trace!(offset, released, "resend buffer purged");
                }
                Ok(())
            }

            WriteWork::SendAck(cursor) => {
                send_frame(w, &mut sink, Frame::control(Message::Ack { offset: cursor })).await
            }

            // All control senders dropped: the Mux itself is being torn
            // down while a transport is still bound
            WriteWork::Cmd(None) => return Disconnect::Cancelled,

            WriteWork::Cmd(Some(cmd)) => match cmd {
                WriteCmd::Register { id, rx } => {
                    // A replayed Open can re-register; the fresh queue wins
                    w.queues.retain(|queue| queue.id != id);
                    w.queues.push(ChannelQueue { id, rx });
                    Ok(())
                }
                WriteCmd::Deregister { id } => {
                    w.queues.retain(|queue| queue.id != id);
                    shared.registry.remove(&id);
                    Ok(())
                }
                WriteCmd::Open { id, kind, target } => {
                    send_reliable(w, &mut sink, id, Message::Open { kind, target }).await
                }
                WriteCmd::OpenAck {
                    id,
                    accepted,
                    reason,
                } => send_reliable(w, &mut sink, id, Message::OpenAck { accepted, reason }).await,
                WriteCmd::Resize(size) => {
                    send_reliable(w, &mut sink, ChannelId::CONTROL, Message::Resize(size)).await
                }
                WriteCmd::SessionEnd { exit_code } => {
                    send_reliable(
                        w,
                        &mut sink,
                        ChannelId::CONTROL,
                        Message::SessionEnd { exit_code },
                    )
                    .await
                }
            },

            WriteWork::Queue(QueueEvent::Chunk(id, bytes)) => {
                send_reliable(w, &mut sink, id, Message::Data(bytes)).await
            }

            WriteWork::Queue(QueueEvent::Drained(id)) => {
                // Send half dropped and the queue is empty: flush-then-FIN
                w.queues.retain(|queue| queue.id != id);
                let sent = send_reliable(w, &mut sink, id, Message::Close).await;
                let fully_closed = match shared.registry.get(&id) {
                    Some(entry) => {
                        let mut state = entry.state.lock().expect("channel state poisoned");
                        state.local_closed = true;
                        state.remote_closed
                    }
                    None => false,
                };
                if fully_closed {
                    shared.registry.remove(&id);
                }
                sent
            }

            WriteWork::Tick => {
                if w.last_tx.elapsed() >= shared.config.heartbeat_interval {
                    send_frame(
                        w,
                        &mut sink,
                        Frame::control(Message::Heartbeat {
                            timestamp: current_time_millis(),
                        }),
                    )
                    .await
                } else {
                    Ok(())
                }
            }
        };

        if let Err(err) = result {
            return lost(err);
        }
    }
}

/// Assign a sequence, retain for replay, and write one reliable frame
async fn send_reliable<T: Transport>(
    w: &mut WriterState,
    sink: &mut SplitSink<Framed<T, FrameCodec>, Frame>,
    channel: ChannelId,
    message: Message,
) -> Result<(), ProtocolError> {
    debug_assert!(message.reliable());
    let probe = Frame::new(channel, 0, message);
    let payload_len = probe.payload_len()?;
    let frame = Frame {
        sequence: w.send.assign(payload_len),
        ..probe
    };
    w.resend.retain(&frame)?;
    // The frame is retained before the write: if the transport dies
    // mid-send, the replay covers it
    send_frame(w, sink, frame).await
}

async fn send_frame<T: Transport>(
    w: &mut WriterState,
    sink: &mut SplitSink<Framed<T, FrameCodec>, Frame>,
    frame: Frame,
) -> Result<(), ProtocolError> {
    w.last_tx = Instant::now();
    sink.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once(
        queues: &mut Vec<ChannelQueue>,
        rr_cursor: &mut usize,
    ) -> Poll<QueueEvent> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        poll_queues(&mut cx, queues, rr_cursor)
    }

    #[tokio::test]
    async fn test_scheduler_round_robins_busy_queues() {
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let mut queues = vec![
            ChannelQueue {
                id: ChannelId::new(2),
                rx: rx_a,
            },
            ChannelQueue {
                id: ChannelId::new(4),
                rx: rx_b,
            },
        ];
        let mut rr_cursor = 0;

        for i in 0..3u8 {
            tx_a.send(Bytes::from(vec![i])).await.unwrap();
            tx_b.send(Bytes::from(vec![i + 100])).await.unwrap();
        }

        // A busy channel cannot monopolize the wire: picks alternate
        let mut order = Vec::new();
        for _ in 0..6 {
            match poll_once(&mut queues, &mut rr_cursor) {
                Poll::Ready(QueueEvent::Chunk(id, _)) => order.push(id.as_u32()),
                other => panic!("expected a chunk, got {:?}", matches!(other, Poll::Pending)),
            }
        }
        assert_eq!(order, vec![2, 4, 2, 4, 2, 4]);

        // Nothing queued: pending, not busy-spinning
        assert!(matches!(poll_once(&mut queues, &mut rr_cursor), Poll::Pending));
    }

    #[tokio::test]
    async fn test_scheduler_reports_drained_queue() {
        let (tx, rx) = mpsc::channel(8);
        let mut queues = vec![ChannelQueue {
            id: ChannelId::new(2),
            rx,
        }];
        let mut rr_cursor = 0;

        tx.send(Bytes::from_static(b"tail")).await.unwrap();
        drop(tx);

        // Flush-then-FIN: the queued chunk first, then the drain signal
        assert!(matches!(
            poll_once(&mut queues, &mut rr_cursor),
            Poll::Ready(QueueEvent::Chunk(_, _))
        ));
        assert!(matches!(
            poll_once(&mut queues, &mut rr_cursor),
            Poll::Ready(QueueEvent::Drained(_))
        ));
    }

    #[test]
    fn test_channel_id_allocation_spaces_do_not_collide() {
        let (client, _events) = Mux::new(Side::Client, MuxConfig::default());
        let (server, _server_events) = Mux::new(Side::Server, MuxConfig::default());

        let client_ids: Vec<u32> = (0..4)
            .map(|_| client.shared.next_channel_id.fetch_add(2, Ordering::SeqCst))
            .collect();
        let server_ids: Vec<u32> = (0..4)
            .map(|_| server.shared.next_channel_id.fetch_add(2, Ordering::SeqCst))
            .collect();

        assert_eq!(client_ids, vec![2, 4, 6, 8]);
        assert_eq!(server_ids, vec![3, 5, 7, 9]);
        assert!(client_ids.iter().all(|id| !server_ids.contains(id)));
    }
}
