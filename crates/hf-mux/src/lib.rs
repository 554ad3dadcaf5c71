//! hf-mux: Channel multiplexer and resumption handshake for Holdfast
//!
//! Used identically by the client reconnect controller and the remote
//! session daemon: one [`Mux`] per session, any number of transports
//! bound to it over the session's lifetime. Logical channels (the
//! terminal, each forwarded connection) are ordinary value handles whose
//! byte order is preserved end-to-end across reconnects.

pub mod bridge;
pub mod channel;
pub mod error;
pub mod handshake;
pub mod mux;

pub use bridge::bridge_stream;
pub use channel::{Channel, ChannelReceiver, ChannelSender, IncomingChannel};
pub use error::{Disconnect, HandshakeError, MuxError};
pub use handshake::{client_resume, reject_unknown, server_accept, ClientHello};
pub use mux::{Mux, MuxConfig, MuxEvent, Side};
