//! The reconnect controller
//!
//! Drives the connection lifecycle for one session from the local side:
//!
//! ```text
//! disconnected -> connecting -> resuming -> attached
//!       ^                                      |
//!       +-------------- transport loss --------+
//! ```
//!
//! Transport loss loops forever with capped exponential backoff; a
//! roaming laptop is the expected case, not an error. Only three things
//! end the loop: the remote shell exiting, the user's explicit
//! terminate, and a bounded run of bootstrap-phase failures (the
//! remote-login invocation itself dying before a session ever answers).
//!
//! All retry state lives in this one instance, passed through the call
//! graph, so the whole machine runs against simulated transports in
//! tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hf_core::config::ClientConfig;
use hf_core::Bootstrap;
use hf_mux::{client_resume, Disconnect, HandshakeError, Mux};
use hf_protocol::{SessionToken, TermSize};

use crate::backoff::ExponentialBackoff;

/// Bound on the resume handshake once a transport is up
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// User-facing status updates, rendered by the terminal layer.
///
/// Transport trouble surfaces only through these: the interactive
/// session sees a pause and a notice line, never a broken pipe.
#[derive(Debug)]
pub enum Notice {
    /// Attached to the session (`resumed` after the first time)
    Attached { resumed: bool },
    /// Transport lost; reconnecting
    ConnectionLost { reason: String },
    /// Waiting out the backoff before the next attempt
    Retrying { delay: Duration },
    /// The remote no longer knows the session; a fresh one is starting
    SessionGone { reason: String },
    /// The remote shell exited
    SessionEnded { exit_code: Option<i32> },
    /// Bootstrap keeps failing; giving up
    GivingUp { attempts: u32 },
}

/// Why the controller stopped driving a session
#[derive(Debug)]
pub enum SessionEnd {
    /// The remote shell exited; the session is over
    Ended { exit_code: Option<i32> },
    /// The resume handshake was rejected: the remote session is gone.
    /// The caller starts a fresh session with a new token.
    Rejected { reason: String },
    /// Consecutive bootstrap failures exceeded the policy
    GaveUp { attempts: u32 },
    /// The user explicitly terminated
    UserExit,
}

/// Reconnect state and policy for one client process
pub struct ReconnectController {
    bootstrap: Arc<dyn Bootstrap>,
    config: ClientConfig,
    notices: mpsc::UnboundedSender<Notice>,
    shutdown: CancellationToken,
    term: String,
    size_of_terminal: Arc<dyn Fn() -> TermSize + Send + Sync>,
}

impl ReconnectController {
    /// Create a controller.
    ///
    /// `shutdown` is the user's terminate signal, the only thing that
    /// stops the retry loop from outside. `size_of_terminal` reads the
    /// current local geometry (injected so tests need no tty).
    pub fn new(
        bootstrap: Arc<dyn Bootstrap>,
        config: ClientConfig,
        notices: mpsc::UnboundedSender<Notice>,
        shutdown: CancellationToken,
        term: String,
        size_of_terminal: Arc<dyn Fn() -> TermSize + Send + Sync>,
    ) -> Self {
        Self {
            bootstrap,
            config,
            notices,
            shutdown,
            term,
            size_of_terminal,
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    /// Count one bootstrap-phase failure against the policy; `Some` means
    /// the limit was hit and the caller returns the hard error.
    fn bootstrap_failed(&self, failures: &mut u32) -> Option<SessionEnd> {
        *failures += 1;
        if *failures >= self.config.policy.max_bootstrap_failures {
            self.notify(Notice::GivingUp {
                attempts: *failures,
            });
            Some(SessionEnd::GaveUp {
                attempts: *failures,
            })
        } else {
            None
        }
    }

    /// Drive one session until it ends.
    ///
    /// `create_first` creates the remote session on the first transport;
    /// reconnects always resume without creating, so a reaped session
    /// surfaces as [`SessionEnd::Rejected`] instead of silently becoming
    /// a new shell under the old token.
    pub async fn drive(&self, mux: &Mux, token: &SessionToken, create_first: bool) -> SessionEnd {
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut bootstrap_failures: u32 = 0;
        let mut attached_before = false;
        let mut first_attempt = true;
        let mut create = create_first;

        loop {
            if self.shutdown.is_cancelled() {
                return SessionEnd::UserExit;
            }

            // disconnected: wait out the backoff (not before the very
            // first attempt)
            if !first_attempt {
                let delay = backoff.next_delay();
                self.notify(Notice::Retrying { delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return SessionEnd::UserExit,
                }
            }
            first_attempt = false;

            // connecting: invoke the remote-login transport
            let transport = tokio::select! {
                result = self.bootstrap.connect(token, create) => match result {
                    Ok(transport) => transport,
                    Err(err) => {
                        tracing::warn!(
                            "bootstrap failed ({}/{}): {}",
                            bootstrap_failures + 1,
                            self.config.policy.max_bootstrap_failures,
                            err
                        );
                        if let Some(end) = self.bootstrap_failed(&mut bootstrap_failures) {
                            return end;
                        }
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => return SessionEnd::UserExit,
            };

            // resuming: exchange cursors, learn where to replay from
            let size = (self.size_of_terminal)();
            let handshake = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                client_resume(transport, token, mux.recv_cursor(), &self.term, size),
            )
            .await;

            let (framed, replay_from) = match handshake {
                Ok(Ok(bound)) => bound,
                Ok(Err(HandshakeError::Rejected { reason })) => {
                    self.notify(Notice::SessionGone {
                        reason: reason.clone(),
                    });
                    return SessionEnd::Rejected { reason };
                }
                Ok(Err(err)) => {
                    // The transport came up but no session spoke our
                    // protocol: bootstrap-class failure
                    tracing::warn!("handshake failed: {}", err);
                    if let Some(end) = self.bootstrap_failed(&mut bootstrap_failures) {
                        return end;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::warn!("handshake timed out");
                    if let Some(end) = self.bootstrap_failed(&mut bootstrap_failures) {
                        return end;
                    }
                    continue;
                }
            };

            // attached
            bootstrap_failures = 0;
            backoff.reset();
            create = false;
            self.notify(Notice::Attached {
                resumed: attached_before,
            });
            attached_before = true;

            // Geometry may have changed while detached
            let _ = mux.send_resize((self.size_of_terminal)()).await;

            let cancel = self.shutdown.child_token();
            let disconnect = mux.run(framed, replay_from, cancel).await;

            match disconnect {
                Disconnect::SessionEnded { exit_code } => {
                    self.notify(Notice::SessionEnded { exit_code });
                    return SessionEnd::Ended { exit_code };
                }
                Disconnect::Cancelled => return SessionEnd::UserExit,
                Disconnect::TransportLost(reason) => {
                    self.notify(Notice::ConnectionLost {
                        reason: reason.clone(),
                    });
                    tracing::info!("transport lost: {}", reason);
                }
                Disconnect::ProtocolViolation(err) => {
                    // Fatal for this transport only; the session survives
                    self.notify(Notice::ConnectionLost {
                        reason: err.to_string(),
                    });
                    tracing::warn!("protocol violation, dropping transport: {}", err);
                }
            }
        }
    }
}
