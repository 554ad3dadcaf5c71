//! Session daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the remote session daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn (None = the user's login shell from $SHELL)
    pub shell: Option<String>,

    /// Extra environment variables for the shell
    pub env: Vec<(String, String)>,

    /// Tear the session down after this long with no bound transport
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Emit a heartbeat after this much outgoing silence
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Declare the transport lost after this much incoming silence
    #[serde(with = "duration_secs")]
    pub grace_interval: Duration,

    /// Maximum unacknowledged bytes retained for replay, per direction
    pub resend_buffer_bytes: usize,

    /// Base directory for per-session runtime directories
    /// (None = the system temp directory)
    pub runtime_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            env: vec![],
            idle_timeout: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(5),
            grace_interval: Duration::from_secs(20),
            resend_buffer_bytes: 8 * 1024 * 1024,
            runtime_dir: None,
        }
    }
}
