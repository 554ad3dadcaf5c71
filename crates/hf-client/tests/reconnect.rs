//! Reconnect-controller tests against simulated transports.
//!
//! A fake bootstrap hands out in-memory duplex pipes wired to an
//! in-process "session daemon" (a real server-side mux that echoes
//! terminal input), so the whole state machine (bootstrap, handshake,
//! resume, backoff, fresh-session fallback) runs without ssh, a PTY,
//! or a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hf_client::{Notice, ReconnectController, SessionEnd};
use hf_core::error::BootstrapError;
use hf_core::transport::{Bootstrap, BoxedTransport};
use hf_mux::{reject_unknown, server_accept, Disconnect, Mux, MuxConfig, MuxEvent, Side};
use hf_protocol::{SessionToken, TermSize};

/// A fake remote session: server-side mux whose shell echoes its input
struct FakeSession {
    mux: Arc<Mux>,
    binding: Mutex<Option<(CancellationToken, JoinHandle<Disconnect>)>>,
}

impl FakeSession {
    fn new() -> Arc<Self> {
        let (mux, mut events) = Mux::new(Side::Server, MuxConfig::default());
        let mux = Arc::new(mux);

        // The "shell": echo every terminal byte back
        let terminal = mux.take_terminal().expect("terminal");
        let (term_tx, mut term_rx) = terminal.split();
        tokio::spawn(async move {
            while let Some(chunk) = term_rx.recv().await {
                if term_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        // No forwarding in these tests
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let MuxEvent::Incoming(incoming) = event {
                    let _ = incoming.reject("not supported by fake session").await;
                }
            }
        });

        Arc::new(Self {
            mux,
            binding: Mutex::new(None),
        })
    }

    /// Accept one transport, superseding any previous binding
    async fn bind(self: Arc<Self>, io: tokio::io::DuplexStream, token: SessionToken) {
        let mut binding = self.binding.lock().await;
        if let Some((cancel, task)) = binding.take() {
            cancel.cancel();
            let _ = task.await;
        }

        match server_accept(io, &token, self.mux.recv_cursor()).await {
            Ok((framed, hello)) => {
                let cancel = CancellationToken::new();
                let task = tokio::spawn({
                    let mux = Arc::clone(&self.mux);
                    let cancel = cancel.clone();
                    async move { mux.run(framed, hello.recv_cursor, cancel).await }
                });
                *binding = Some((cancel, task));
            }
            Err(err) => panic!("fake session handshake failed: {}", err),
        }
    }

    /// Kill the bound transport, as a dropped connection would
    async fn kill_transport(&self) {
        let mut binding = self.binding.lock().await;
        if let Some((cancel, task)) = binding.take() {
            cancel.cancel();
            let _ = task.await;
        }
    }
}

/// Bootstrap handing out duplex pipes to fake sessions
struct SimBootstrap {
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    /// Inject this many bootstrap failures before connecting again
    fail_injections: AtomicU32,
}

impl SimBootstrap {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            fail_injections: AtomicU32::new(0),
        })
    }

    fn inject_failures(&self, count: u32) {
        self.fail_injections.store(count, Ordering::SeqCst);
    }

    async fn session(&self, token: &SessionToken) -> Arc<FakeSession> {
        Arc::clone(
            self.sessions
                .lock()
                .await
                .get(token.as_str())
                .expect("session exists"),
        )
    }

    /// Reap a session: the next resume gets a rejection
    async fn reap(&self, token: &SessionToken) {
        if let Some(session) = self.sessions.lock().await.remove(token.as_str()) {
            session.kill_transport().await;
        }
    }
}

#[async_trait]
impl Bootstrap for SimBootstrap {
    async fn connect(
        &self,
        token: &SessionToken,
        create: bool,
    ) -> Result<BoxedTransport, BootstrapError> {
        loop {
            let remaining = self.fail_injections.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .fail_injections
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(BootstrapError::Exited { status: Some(255) });
            }
        }

        let (client_io, server_io) = tokio::io::duplex(256 * 1024);

        let mut sessions = self.sessions.lock().await;
        match sessions.get(token.as_str()) {
            Some(session) => {
                tokio::spawn(Arc::clone(session).bind(server_io, token.clone()));
            }
            None if create => {
                let session = FakeSession::new();
                sessions.insert(token.as_str().to_string(), Arc::clone(&session));
                tokio::spawn(session.bind(server_io, token.clone()));
            }
            None => {
                // The attach bridge's stale-token path
                tokio::spawn(async move {
                    let _ = reject_unknown(server_io, "unknown session").await;
                });
            }
        }

        Ok(Box::new(client_io))
    }
}

fn test_config() -> hf_core::config::ClientConfig {
    let mut config = hf_core::config::ClientConfig::default();
    config.backoff.initial = Duration::from_millis(20);
    config.backoff.max = Duration::from_millis(100);
    config.backoff.jitter = 0.0;
    config.policy.max_bootstrap_failures = 3;
    config
}

struct Harness {
    controller: Arc<ReconnectController>,
    notices: mpsc::UnboundedReceiver<Notice>,
    shutdown: CancellationToken,
}

fn harness(bootstrap: Arc<SimBootstrap>) -> Harness {
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let controller = Arc::new(ReconnectController::new(
        bootstrap,
        test_config(),
        notice_tx,
        shutdown.clone(),
        "xterm".to_string(),
        Arc::new(TermSize::default),
    ));
    Harness {
        controller,
        notices,
        shutdown,
    }
}

async fn recv_until(receiver: &mut hf_mux::ChannelReceiver, until: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !collected.ends_with(until) {
            let chunk = receiver.recv().await.expect("channel closed early");
            collected.extend_from_slice(&chunk);
        }
    })
    .await
    .expect("timed out waiting for data");
    collected
}

/// The full loop: connect, exchange bytes, lose the transport, resume,
/// exchange more bytes: each byte delivered exactly once, in order.
#[tokio::test]
async fn session_survives_transport_kill() {
    let bootstrap = SimBootstrap::new();
    let mut h = harness(Arc::clone(&bootstrap));

    let (mux, _events) = Mux::new(Side::Client, MuxConfig::default());
    let mux = Arc::new(mux);
    let (term_tx, mut term_rx) = mux.take_terminal().unwrap().split();
    let token = SessionToken::generate();

    let drive = tokio::spawn({
        let controller = Arc::clone(&h.controller);
        let mux = Arc::clone(&mux);
        let token = token.clone();
        async move { controller.drive(&mux, &token, true).await }
    });

    term_tx.send(Bytes::from_static(b"echo hi\n")).await.unwrap();
    assert_eq!(recv_until(&mut term_rx, b"echo hi\n").await, b"echo hi\n");

    // Transport dies under us
    bootstrap.session(&token).await.kill_transport().await;

    // Typed during or after the outage; arrives exactly once after the
    // controller resumes on its own
    term_tx.send(Bytes::from_static(b"again\n")).await.unwrap();
    assert_eq!(recv_until(&mut term_rx, b"again\n").await, b"again\n");

    // Explicit user exit is the only thing that stops the retry loop
    h.shutdown.cancel();
    let end = drive.await.unwrap();
    assert!(matches!(end, SessionEnd::UserExit));

    // Notices tell the story: connected, lost, resumed
    let mut saw = Vec::new();
    while let Ok(notice) = h.notices.try_recv() {
        saw.push(notice);
    }
    assert!(matches!(saw.first(), Some(Notice::Attached { resumed: false })));
    assert!(saw
        .iter()
        .any(|n| matches!(n, Notice::ConnectionLost { .. })));
    assert!(saw
        .iter()
        .any(|n| matches!(n, Notice::Attached { resumed: true })));
}

/// Presenting a token the remote has no record of resolves to a
/// rejection promptly, never a hang.
#[tokio::test]
async fn unknown_session_rejected_fast() {
    let bootstrap = SimBootstrap::new();
    let h = harness(Arc::clone(&bootstrap));

    let (mux, _events) = Mux::new(Side::Client, MuxConfig::default());
    let token = SessionToken::generate();

    let end = tokio::time::timeout(
        Duration::from_secs(5),
        h.controller.drive(&mux, &token, false),
    )
    .await
    .expect("drive hung on unknown session");

    match end {
        SessionEnd::Rejected { reason } => assert!(reason.contains("unknown")),
        other => panic!("expected Rejected, got {:?}", other),
    }
}

/// A reaped session (idle timeout on the remote side) surfaces as a
/// rejection on the next resume, which the client turns into a fresh
/// session rather than an error.
#[tokio::test]
async fn reaped_session_resume_is_rejected() {
    let bootstrap = SimBootstrap::new();
    let h = harness(Arc::clone(&bootstrap));

    let (mux, _events) = Mux::new(Side::Client, MuxConfig::default());
    let mux = Arc::new(mux);
    let (term_tx, mut term_rx) = mux.take_terminal().unwrap().split();
    let token = SessionToken::generate();

    let drive = tokio::spawn({
        let controller = Arc::clone(&h.controller);
        let mux = Arc::clone(&mux);
        let token = token.clone();
        async move { controller.drive(&mux, &token, true).await }
    });

    term_tx.send(Bytes::from_static(b"hello\n")).await.unwrap();
    assert_eq!(recv_until(&mut term_rx, b"hello\n").await, b"hello\n");

    // Idle reaping on the remote: session state is gone for good
    bootstrap.reap(&token).await;

    let end = tokio::time::timeout(Duration::from_secs(5), drive)
        .await
        .expect("drive hung after reap")
        .unwrap();
    assert!(matches!(end, SessionEnd::Rejected { .. }));
}

/// Bootstrap failures are retried with backoff but bounded by policy,
/// converting to a hard error instead of retrying forever.
#[tokio::test]
async fn bootstrap_failures_convert_to_hard_error() {
    let bootstrap = SimBootstrap::new();
    bootstrap.inject_failures(u32::MAX);
    let mut h = harness(Arc::clone(&bootstrap));

    let (mux, _events) = Mux::new(Side::Client, MuxConfig::default());
    let token = SessionToken::generate();

    let end = tokio::time::timeout(
        Duration::from_secs(10),
        h.controller.drive(&mux, &token, true),
    )
    .await
    .expect("drive hung while failing bootstrap");

    match end {
        SessionEnd::GaveUp { attempts } => assert_eq!(attempts, 3),
        other => panic!("expected GaveUp, got {:?}", other),
    }

    let mut last = None;
    while let Ok(notice) = h.notices.try_recv() {
        last = Some(notice);
    }
    assert!(matches!(last, Some(Notice::GivingUp { attempts: 3 })));
}

/// The user's terminate is honored even while waiting out the backoff.
#[tokio::test]
async fn user_exit_stops_retry_loop() {
    let bootstrap = SimBootstrap::new();
    bootstrap.inject_failures(2);
    let h = harness(Arc::clone(&bootstrap));

    // Long backoff: without the shutdown the drive would sit in it
    let mut config = test_config();
    config.backoff.initial = Duration::from_secs(60);
    config.policy.max_bootstrap_failures = 100;
    let (notice_tx, _notices) = mpsc::unbounded_channel();
    let controller = ReconnectController::new(
        bootstrap,
        config,
        notice_tx,
        h.shutdown.clone(),
        "xterm".to_string(),
        Arc::new(TermSize::default),
    );

    let (mux, _events) = Mux::new(Side::Client, MuxConfig::default());
    let token = SessionToken::generate();

    let drive = tokio::spawn(async move { controller.drive(&mux, &token, true).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.shutdown.cancel();

    let end = tokio::time::timeout(Duration::from_secs(5), drive)
        .await
        .expect("drive ignored the user exit")
        .unwrap();
    assert!(matches!(end, SessionEnd::UserExit));
}
