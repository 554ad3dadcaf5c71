//! hf-protocol: Wire protocol for Holdfast session resumption and
//! channel multiplexing.
//!
//! This crate defines the binary frame format exchanged between the client
//! and the remote session daemon over a bootstrapped transport, plus the
//! per-direction sequence bookkeeping that makes delivery resumable across
//! transport replacement.

pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod resume;
pub mod session;

pub use channel::ChannelId;
pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, DATA_CHUNK, HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use message::{ChannelKind, ForwardTarget, FrameType, Message, TermSize, PROTOCOL_VERSION};
pub use resume::{Reassembly, ResendBuffer, RetainedFrame, SendState};
pub use session::SessionToken;
