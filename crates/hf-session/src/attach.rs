//! The attach bridge
//!
//! Invoked over the remote-login transport for every (re)connection:
//! `holdfast-session attach --session <token> [--create]`. It is a dumb
//! byte pipe between its own stdio (the transport) and the session
//! daemon's control socket; the daemon does all the protocol work, so
//! the bridge process can die with the transport without losing
//! anything.
//!
//! When the session is gone and `--create` was not given, the bridge
//! answers the client's resume request itself with a rejection frame:
//! a stale token fails fast instead of hanging the client.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixStream;

use hf_core::config::SessionConfig;
use hf_core::StreamPair;
use hf_mux::reject_unknown;
use hf_protocol::SessionToken;

use crate::daemon;
use crate::paths::SessionPaths;

/// How long to wait for a freshly spawned daemon to bind its socket
const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the daemon socket
const DAEMON_START_POLL: Duration = Duration::from_millis(50);

/// Bridge stdio to the session daemon for `token`.
///
/// With `create`, a missing daemon is spawned (detached) first; without
/// it, a missing daemon is reported to the client as a resume rejection.
pub async fn run_attach(
    token: SessionToken,
    create: bool,
    config: SessionConfig,
    config_path: Option<&Path>,
) -> Result<()> {
    let paths = SessionPaths::new(config.runtime_dir.as_deref(), &token);

    let stream = match connect_daemon(&paths).await {
        Some(stream) => stream,
        None if create => {
            paths.create()?;
            daemon::spawn_detached(&token, &paths, config_path)?;
            wait_for_daemon(&paths)
                .await
                .context("session daemon did not come up")?
        }
        None => {
            tracing::info!("no session {}; rejecting resume", token);
            let stdio = StreamPair::new(tokio::io::stdin(), tokio::io::stdout());
            reject_unknown(stdio, "unknown session (expired or never created)")
                .await
                .context("failed to send rejection")?;
            return Ok(());
        }
    };

    tracing::debug!("bridging transport to session {}", token);
    let mut stdio = StreamPair::new(tokio::io::stdin(), tokio::io::stdout());
    let mut stream = stream;

    // Pure byte passthrough; ends when either side closes. The daemon
    // treats our disappearance as transport loss, nothing more.
    match tokio::io::copy_bidirectional(&mut stdio, &mut stream).await {
        Ok((up, down)) => tracing::debug!("bridge finished ({} up, {} down)", up, down),
        Err(err) => tracing::debug!("bridge ended: {}", err),
    }
    Ok(())
}

/// Try to reach the daemon's control socket.
///
/// A socket file with nobody listening (daemon crashed) counts as no
/// daemon.
async fn connect_daemon(paths: &SessionPaths) -> Option<UnixStream> {
    let socket = paths.control_socket();
    if !socket.exists() {
        return None;
    }
    match UnixStream::connect(&socket).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!("stale session socket {:?}: {}", socket, err);
            None
        }
    }
}

/// Wait for a freshly spawned daemon to start listening.
async fn wait_for_daemon(paths: &SessionPaths) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + DAEMON_START_TIMEOUT;
    loop {
        if let Some(stream) = connect_daemon(paths).await {
            return Ok(stream);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "daemon socket {:?} not ready after {:?}",
                paths.control_socket(),
                DAEMON_START_TIMEOUT
            );
        }
        tokio::time::sleep(DAEMON_START_POLL).await;
    }
}
