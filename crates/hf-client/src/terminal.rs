//! Local terminal bridging
//!
//! Raw byte passthrough between the local terminal and the session's
//! terminal channel: keystrokes go out unmodified (the remote PTY owns
//! line discipline), output bytes are written verbatim. The one local
//! key is Ctrl-], the explicit terminate, the only way to stop the
//! reconnect loop from the keyboard.
//!
//! Geometry changes (SIGWINCH) become Resize frames rather than in-band
//! escape sequences, keeping the data stream byte-transparent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hf_mux::{ChannelReceiver, ChannelSender, Mux};
use hf_protocol::TermSize;

use crate::controller::Notice;

/// The explicit-terminate key (Ctrl-])
const TERMINATE_KEY: u8 = 0x1d;

/// Puts the local terminal in raw mode for the guard's lifetime
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enable raw mode; restored on drop.
    ///
    /// Running without a tty (tests, pipes) is not an error; the guard
    /// just does nothing.
    pub fn enable() -> Self {
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { active: true },
            Err(err) => {
                tracing::debug!("raw mode unavailable: {}", err);
                Self { active: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Current local terminal geometry (24x80 when there is no tty)
pub fn current_size() -> TermSize {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => TermSize::new(rows, cols),
        Err(_) => TermSize::default(),
    }
}

/// Keystrokes into the terminal channel; Ctrl-] terminates.
pub fn spawn_stdin_task(sender: ChannelSender, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::select! {
                read = stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = shutdown.cancelled() => break,
            };

            let data = &buf[..n];
            if let Some(pos) = data.iter().position(|&b| b == TERMINATE_KEY) {
                // Forward what came before the terminate key, then stop
                if pos > 0 {
                    let _ = sender.send(Bytes::copy_from_slice(&data[..pos])).await;
                }
                shutdown.cancel();
                break;
            }
            if sender.send(Bytes::copy_from_slice(data)).await.is_err() {
                break;
            }
        }
    })
}

/// Terminal channel output onto the local terminal, verbatim.
pub fn spawn_stdout_task(mut receiver: ChannelReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = receiver.recv().await {
            if stdout.write_all(&chunk).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    })
}

/// SIGWINCH into Resize frames.
pub fn spawn_winch_task(mux: Arc<Mux>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut winch = match signal(SignalKind::window_change()) {
            Ok(winch) => winch,
            Err(err) => {
                tracing::debug!("no SIGWINCH handling: {}", err);
                return;
            }
        };
        loop {
            tokio::select! {
                received = winch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    let _ = mux.send_resize(current_size()).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

/// Render controller notices as single status lines on stderr.
///
/// stderr is the same tty but keeps notices out of the byte-exact
/// output stream; `\r\n` keeps lines sane in raw mode.
pub fn spawn_notice_task(mut notices: mpsc::UnboundedReceiver<Notice>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let line = match notice {
                Notice::Attached { resumed: false } => "connected".to_string(),
                Notice::Attached { resumed: true } => "session resumed".to_string(),
                Notice::ConnectionLost { reason } => {
                    format!("connection lost ({}); reconnecting...", reason)
                }
                Notice::Retrying { delay } => {
                    format!("retrying in {}s (Ctrl-] to give up)", delay.as_secs().max(1))
                }
                Notice::SessionGone { reason } => {
                    format!("remote session is gone ({}); starting a fresh one", reason)
                }
                Notice::SessionEnded { exit_code } => match exit_code {
                    Some(0) | None => "session ended".to_string(),
                    Some(code) => format!("session ended (exit {})", code),
                },
                Notice::GivingUp { attempts } => {
                    format!("giving up after {} failed connection attempts", attempts)
                }
            };
            eprint!("\r\n[holdfast] {}\r\n", line);
        }
    })
}

/// Await a task briefly, then abort it; used at session teardown so
/// buffered output gets a chance to flush.
pub async fn drain_or_abort(mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        task.abort();
    }
}
