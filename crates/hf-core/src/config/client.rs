//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the Holdfast client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Command used to invoke the remote-login transport
    pub ssh_command: String,

    /// Extra arguments always passed to the transport command
    pub ssh_args: Vec<String>,

    /// Remote command that attaches a transport to the session daemon
    pub remote_command: String,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Reconnect policy knobs
    pub policy: ReconnectPolicy,

    /// Emit a heartbeat after this much outgoing silence
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Declare the transport lost after this much incoming silence
    #[serde(with = "duration_secs")]
    pub grace_interval: Duration,

    /// Maximum unacknowledged bytes retained for replay, per direction
    pub resend_buffer_bytes: usize,

    /// Forward connections to the local credential agent
    pub forward_agent: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ssh_command: "ssh".to_string(),
            ssh_args: vec![],
            remote_command: "holdfast-session".to_string(),
            backoff: BackoffConfig::default(),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(5),
            grace_interval: Duration::from_secs(20),
            resend_buffer_bytes: 8 * 1024 * 1024,
            forward_agent: false,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Tunable reconnect policy.
///
/// Transient network loss is the expected failure mode, so transport
/// losses after a successful attach retry forever. Bootstrap-phase
/// failures (the remote-login invocation itself dying, e.g. repeated
/// authentication rejections against an unreachable host) are bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive bootstrap failures before giving up with a hard error
    pub max_bootstrap_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_bootstrap_failures: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ClientConfig::default();
        // Heartbeats must come well inside the loss grace interval
        assert!(config.heartbeat_interval * 2 <= config.grace_interval);
        assert!(config.policy.max_bootstrap_failures >= 1);
        assert!(config.backoff.initial <= config.backoff.max);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ClientConfig = toml::from_str("forward_agent = true").unwrap();
        assert!(config.forward_agent);
        assert_eq!(config.ssh_command, "ssh");
        assert_eq!(config.grace_interval, Duration::from_secs(20));
    }
}
