//! The interactive client
//!
//! Owns what lives longer than any one session: the raw-mode guard, the
//! notice renderer, and the fresh-session fallback. Each session gets
//! its own multiplexer, terminal bridge, and forwarding listeners; when
//! the remote reports the session gone, everything is rebuilt under a
//! new token and the loop continues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hf_core::config::ClientConfig;
use hf_mux::{Mux, MuxConfig, Side};
use hf_protocol::SessionToken;

use crate::bootstrap::SshBootstrap;
use crate::controller::{ReconnectController, SessionEnd};
use crate::forward::ForwardSpec;
use crate::terminal;

/// How long session teardown waits for buffered output to reach the
/// screen before aborting the bridge tasks
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to run an interactive Holdfast client
pub struct Client {
    /// ssh destination (`user@host` or an ssh config alias)
    pub destination: String,
    /// Client configuration
    pub config: ClientConfig,
    /// Local forwards to maintain
    pub forwards: Vec<ForwardSpec>,
    /// Resume this token instead of generating a fresh one
    pub session: Option<SessionToken>,
}

impl Client {
    /// Run until the remote shell exits, the user terminates with
    /// Ctrl-], or bootstrap gives up. Returns the shell's exit code.
    pub async fn run(self) -> Result<i32> {
        let bootstrap = Arc::new(SshBootstrap::new(
            self.destination.clone(),
            self.config.clone(),
        ));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());

        let controller = ReconnectController::new(
            bootstrap,
            self.config.clone(),
            notice_tx,
            shutdown.clone(),
            term,
            Arc::new(terminal::current_size),
        );

        // Raw mode for the whole run; notices render through stderr
        let _raw = terminal::RawModeGuard::enable();
        let notice_task = terminal::spawn_notice_task(notice_rx);

        let mut token = self.session.clone().unwrap_or_else(SessionToken::generate);
        let mut create = true;

        let exit_code = loop {
            tracing::info!("starting session {}", token);

            let mux_config = MuxConfig {
                heartbeat_interval: self.config.heartbeat_interval,
                grace_interval: self.config.grace_interval,
                resend_buffer_bytes: self.config.resend_buffer_bytes,
                ..MuxConfig::default()
            };
            let (mux, events) = Mux::new(Side::Client, mux_config);
            let mux = Arc::new(mux);

            // Per-session wiring: terminal bridge, winch, events, forwards
            let (term_tx, term_rx) = mux
                .take_terminal()
                .expect("terminal channel taken once per mux")
                .split();
            let stdin_task = terminal::spawn_stdin_task(term_tx, shutdown.clone());
            let stdout_task = terminal::spawn_stdout_task(term_rx);
            let winch_task = terminal::spawn_winch_task(Arc::clone(&mux), shutdown.clone());
            let events_task =
                crate::forward::spawn_event_handler(events, self.config.forward_agent);

            let mut forward_tasks = Vec::new();
            for spec in &self.forwards {
                let task = crate::forward::spawn_forward_listener(Arc::clone(&mux), spec.clone())
                    .await
                    .with_context(|| {
                        format!("cannot listen on {}:{}", spec.bind_address, spec.bind_port)
                    })?;
                forward_tasks.push(task);
            }

            let end = controller.drive(&mux, &token, create).await;

            // Tear down this session's wiring; let output flush first
            terminal::drain_or_abort(stdout_task, OUTPUT_DRAIN_GRACE).await;
            stdin_task.abort();
            winch_task.abort();
            events_task.abort();
            for task in forward_tasks {
                task.abort();
            }

            match end {
                SessionEnd::Ended { exit_code } => break exit_code.unwrap_or(0),
                SessionEnd::UserExit => break 0,
                SessionEnd::GaveUp { attempts } => {
                    return Err(hf_core::error::BootstrapError::RetriesExhausted { attempts }.into());
                }
                SessionEnd::Rejected { reason } => {
                    tracing::info!("session rejected ({}); starting fresh", reason);
                    token = SessionToken::generate();
                    create = true;
                }
            }
        };

        drop(controller);
        terminal::drain_or_abort(notice_task, OUTPUT_DRAIN_GRACE).await;
        Ok(exit_code)
    }
}
