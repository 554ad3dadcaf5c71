//! Per-session runtime directory layout
//!
//! Each live session owns one directory under the runtime base
//! (`/tmp` by default):
//!
//! ```text
//! holdfast.<token>/
//!   control.sock   attach bridges connect here
//!   agent.sock     exported to the shell as SSH_AUTH_SOCK
//!   session.json   metadata for `holdfast-session list`
//!   daemon.log     the detached daemon's stdout/stderr
//! ```
//!
//! The directory is created mode 0700 and removed at session teardown;
//! its presence is what distinguishes a resumable session from a reaped
//! one.

use std::io;
use std::path::{Path, PathBuf};

use hf_protocol::SessionToken;

/// Prefix for session directory names
const DIR_PREFIX: &str = "holdfast.";

/// Paths inside one session's runtime directory
#[derive(Debug, Clone)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    /// Resolve the directory for `token` under `base` (the system temp
    /// directory when unset)
    pub fn new(base: Option<&Path>, token: &SessionToken) -> Self {
        let base = base
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            dir: base.join(format!("{}{}", DIR_PREFIX, token)),
        }
    }

    /// The session directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Control socket the attach bridges connect to
    pub fn control_socket(&self) -> PathBuf {
        self.dir.join("control.sock")
    }

    /// Credential-agent listener exported to the shell
    pub fn agent_socket(&self) -> PathBuf {
        self.dir.join("agent.sock")
    }

    /// Session metadata file
    pub fn metadata(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    /// The detached daemon's log file
    pub fn log_file(&self) -> PathBuf {
        self.dir.join("daemon.log")
    }

    /// Whether a session directory exists for this token
    pub fn exists(&self) -> bool {
        self.dir.exists()
    }

    /// Create the directory, private to the owning user
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Remove the directory and everything in it
    pub fn remove(&self) -> io::Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Enumerate session directories under `base`, returning each token and
/// its paths. Entries that don't parse as tokens are skipped.
pub fn list_sessions(base: Option<&Path>) -> io::Result<Vec<(SessionToken, SessionPaths)>> {
    let base = base
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);

    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(&base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(token_str) = name.to_str().and_then(|n| n.strip_prefix(DIR_PREFIX)) else {
            continue;
        };
        if let Some(token) = SessionToken::parse(token_str) {
            let paths = SessionPaths::new(Some(&base), &token);
            sessions.push((token, paths));
        }
    }
    Ok(sessions)
}
