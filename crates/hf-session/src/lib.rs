//! hf-session: The Holdfast remote session daemon
//!
//! One detached daemon process per session owns the PTY, the shell, and
//! the server side of the resumption protocol. The `attach` bridge is
//! invoked over the remote-login transport for every (re)connection and
//! pipes its stdio to the daemon's control socket; the daemon survives
//! any number of such bridges coming and going.

pub mod attach;
pub mod daemon;
pub mod meta;
pub mod paths;
pub mod pty;

pub use paths::SessionPaths;
