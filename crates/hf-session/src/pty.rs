//! The session's pseudo-terminal and shell process
//!
//! One daemon owns exactly one PTY and one shell for the lifetime of the
//! session, using the portable-pty crate. The slave side is dropped once
//! the shell is spawned, so the master reader reaches end-of-file when
//! the shell exits and the output pipeline drains naturally.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use hf_protocol::TermSize;

/// The PTY master and shell child for one session
pub struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Option<Box<dyn std::io::Write + Send>>,
    /// Shell binary that was spawned
    pub shell: String,
    /// Process id of the shell, if known
    pub pid: Option<u32>,
}

/// Resolve which shell to spawn: config override, then the login shell
/// from $SHELL, then /bin/sh.
fn resolve_shell(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl PtyShell {
    /// Allocate a PTY and spawn the shell attached to it.
    ///
    /// `agent_sock` is exported as SSH_AUTH_SOCK so programs in the
    /// shell reach the forwarded credential agent.
    pub fn spawn(
        configured_shell: Option<&str>,
        env: &[(String, String)],
        term: &str,
        size: TermSize,
        agent_sock: Option<&Path>,
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .with_context(|| "Failed to open PTY")?;

        let shell = resolve_shell(configured_shell);
        tracing::info!(
            "spawning {} on a {}x{} terminal",
            shell,
            size.cols,
            size.rows
        );

        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", term);
        if let Some(sock) = agent_sock {
            cmd.env("SSH_AUTH_SOCK", sock);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(home) = std::env::var_os("HOME") {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell))?;
        let pid = child.process_id();
        tracing::info!("shell running with pid {:?}", pid);

        // No other slave holder: the master reader sees EOF on shell exit
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .with_context(|| "Failed to take PTY writer")?;

        Ok(Self {
            master: pair.master,
            child,
            writer: Some(writer),
            shell,
            pid,
        })
    }

    /// Clone a blocking reader for the PTY master (for the reader task)
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .with_context(|| "Failed to clone PTY reader")
    }

    /// Take the write half (available exactly once, for the input task)
    pub fn take_writer(&mut self) -> Option<Box<dyn std::io::Write + Send>> {
        self.writer.take()
    }

    /// Apply new terminal geometry
    pub fn resize(&self, size: TermSize) -> Result<()> {
        tracing::debug!("resizing terminal to {}x{}", size.cols, size.rows);
        self.master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .with_context(|| "Failed to resize PTY")?;
        Ok(())
    }

    /// Check whether the shell has exited, without blocking
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.exit_code() as i32)),
            Ok(None) => Ok(None),
            Err(err) => Err(err).with_context(|| "Failed to check shell status"),
        }
    }

    /// Kill the shell and reap it
    pub fn kill(&mut self) -> Option<i32> {
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shell_prefers_configured() {
        assert_eq!(resolve_shell(Some("/bin/zsh")), "/bin/zsh");
    }

    #[test]
    fn test_resolve_shell_falls_back() {
        // With no override the result is $SHELL or /bin/sh; either way
        // it is a non-empty absolute path
        let shell = resolve_shell(None);
        assert!(shell.starts_with('/'));
    }
}
