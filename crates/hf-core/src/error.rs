//! Core error types for Holdfast

use hf_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the Holdfast ecosystem
#[derive(Error, Debug)]
pub enum HfError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bootstrap error
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures establishing a transport via the remote-login mechanism.
///
/// Every variant except `RetriesExhausted` is transient from the
/// controller's point of view and retried with backoff; the controller
/// converts a run of consecutive failures into `RetriesExhausted` once
/// the configured policy limit is hit.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The remote-login command could not be spawned at all
    #[error("Failed to launch remote-login transport: {0}")]
    Launch(#[source] std::io::Error),

    /// The transport process exited before a usable byte stream existed
    #[error("Remote-login transport exited during bootstrap (status {status:?})")]
    Exited { status: Option<i32> },

    /// The transport process came up without usable stdio pipes
    #[error("Remote-login transport has no usable stdio")]
    MissingStdio,

    /// Consecutive bootstrap failures exceeded the configured policy
    #[error("Giving up after {attempts} consecutive bootstrap failures")]
    RetriesExhausted { attempts: u32 },
}

/// Session-related errors on the daemon side
#[derive(Error, Debug)]
pub enum SessionError {
    /// No live session for the presented token
    #[error("Session not found: {0}")]
    NotFound(String),

    /// A session directory for this token already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// The session daemon could not be detached
    #[error("Failed to detach session daemon: {0}")]
    DetachFailed(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
