//! hf-client: The local side of a Holdfast session
//!
//! The reconnect controller drives bootstrap, resumption, and backoff;
//! the terminal module bridges the local tty; forwarding listeners map
//! local connections onto session channels. The controller is generic
//! over the [`hf_core::Bootstrap`] seam, so everything here runs against
//! in-memory transports in tests.

pub mod backoff;
pub mod bootstrap;
pub mod client;
pub mod controller;
pub mod forward;
pub mod terminal;

pub use backoff::ExponentialBackoff;
pub use bootstrap::SshBootstrap;
pub use client::Client;
pub use controller::{Notice, ReconnectController, SessionEnd};
pub use forward::ForwardSpec;
