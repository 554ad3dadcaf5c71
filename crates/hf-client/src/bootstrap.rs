//! Bootstrap over the system remote-login mechanism
//!
//! One ssh invocation per transport: the remote command is the attach
//! bridge, and the child's stdin/stdout become the session byte stream.
//! ssh is a black-box collaborator here: authentication, host keys, and
//! connection sharing stay its business.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use hf_core::config::ClientConfig;
use hf_core::error::BootstrapError;
use hf_core::transport::{Bootstrap, BoxedTransport, StreamPair};
use hf_protocol::SessionToken;

/// Connects transports by invoking `ssh <destination> -- holdfast-session attach …`
pub struct SshBootstrap {
    destination: String,
    config: ClientConfig,
}

impl SshBootstrap {
    /// Create a bootstrap for one destination
    pub fn new(destination: String, config: ClientConfig) -> Self {
        Self {
            destination,
            config,
        }
    }
}

#[async_trait]
impl Bootstrap for SshBootstrap {
    async fn connect(
        &self,
        token: &SessionToken,
        create: bool,
    ) -> Result<BoxedTransport, BootstrapError> {
        let mut remote = format!(
            "{} attach --session {}",
            self.config.remote_command,
            token.as_str()
        );
        if create {
            remote.push_str(" --create");
        }

        let mut cmd = Command::new(&self.config.ssh_command);
        cmd.args(&self.config.ssh_args)
            // The remote command carries binary frames: no remote tty
            .arg("-T")
            .arg(&self.destination)
            .arg("--")
            .arg(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            "bootstrapping transport: {} {} -- {}",
            self.config.ssh_command,
            self.destination,
            remote
        );

        let mut child = cmd.spawn().map_err(BootstrapError::Launch)?;
        let stdin = child.stdin.take().ok_or(BootstrapError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(BootstrapError::MissingStdio)?;

        // ssh's own diagnostics (auth prompts aside) go to our log
        // instead of scribbling on the raw terminal
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "ssh", "{}", line);
                }
            });
        }

        Ok(Box::new(SshTransport {
            io: StreamPair::new(stdout, stdin),
            _child: child,
        }))
    }
}

/// A live ssh child presented as a byte stream.
///
/// Dropping the transport kills the ssh process, so an abandoned
/// connection attempt never leaks a child.
struct SshTransport {
    io: StreamPair<ChildStdout, ChildStdin>,
    _child: Child,
}

impl AsyncRead for SshTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_failure_is_bootstrap_error() {
        let config = ClientConfig {
            ssh_command: "/nonexistent/ssh-binary".to_string(),
            ..ClientConfig::default()
        };
        let bootstrap = SshBootstrap::new("example.invalid".to_string(), config);

        let result = bootstrap.connect(&SessionToken::generate(), true).await;
        assert!(matches!(result, Err(BootstrapError::Launch(_))));
    }
}
