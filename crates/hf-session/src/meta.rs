//! Session metadata file
//!
//! Written once at shell start and used by `holdfast-session list`;
//! nothing in the protocol depends on it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hf_core::time::current_time_millis;
use hf_protocol::SessionToken;

/// Metadata describing one live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    /// The session's token
    pub token: SessionToken,
    /// The daemon's pid
    pub daemon_pid: u32,
    /// The shell's pid, once spawned
    pub shell_pid: Option<u32>,
    /// Shell binary in use
    pub shell: String,
    /// Unix millis when the session was created
    pub created_at: u64,
}

impl SessionMeta {
    /// Describe the current process's session
    pub fn new(token: SessionToken, shell: String, shell_pid: Option<u32>) -> Self {
        Self {
            token,
            daemon_pid: std::process::id(),
            shell_pid,
            shell,
            created_at: current_time_millis(),
        }
    }

    /// Write the metadata file
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session metadata to {:?}", path))?;
        Ok(())
    }

    /// Read a metadata file
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session metadata from {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let meta = SessionMeta::new(SessionToken::generate(), "/bin/bash".to_string(), Some(4242));
        meta.write(&path).unwrap();

        let loaded = SessionMeta::read(&path).unwrap();
        assert_eq!(loaded.token, meta.token);
        assert_eq!(loaded.shell_pid, Some(4242));
        assert_eq!(loaded.shell, "/bin/bash");
        assert!(loaded.created_at > 0);
    }
}
