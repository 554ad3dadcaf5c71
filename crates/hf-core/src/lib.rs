//! hf-core: Core abstractions and configuration for Holdfast
//!
//! This crate provides the shared error taxonomy, configuration
//! structures, time helpers, and the transport/bootstrap traits used by
//! the client and the remote session daemon.

pub mod config;
pub mod error;
pub mod time;
pub mod transport;

pub use error::HfError;
pub use transport::{Bootstrap, BoxedTransport, StreamPair, Transport};
