//! The detached session manager
//!
//! One daemon process per session, orphaned from the remote-login
//! transport that started it. It owns the PTY and the server side of
//! the resumption protocol; attach bridges come and go on the control
//! socket, and exactly one of them is bound at a time.

use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hf_core::config::SessionConfig;
use hf_mux::{
    bridge_stream, server_accept, ChannelReceiver, ChannelSender, ClientHello, Disconnect,
    IncomingChannel, Mux, MuxConfig, MuxEvent, Side,
};
use hf_protocol::{ChannelKind, SessionToken};

use crate::meta::SessionMeta;
use crate::paths::SessionPaths;
use crate::pty::PtyShell;

/// Capacity of the PTY-output queue between the reader thread and the
/// terminal channel forwarder
const PTY_OUTPUT_QUEUE: usize = 256;

/// Housekeeping sweep interval: shell exit, binding state, idle reaping
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed for final output and the SessionEnd frame to flush
/// before teardown
const END_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Spawn the session daemon for `token`, detached from this process.
///
/// The single process-lifecycle trick that makes sessions outlive the
/// transport lives here: the child is started in its own session via
/// `setsid`, with stdio on the session log file, so the exit of the
/// remote-login process (and its process group signals) never reaches
/// the shell.
pub fn spawn_detached(
    token: &SessionToken,
    paths: &SessionPaths,
    config_path: Option<&Path>,
) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let log = std::fs::File::create(paths.log_file())
        .with_context(|| format!("cannot create {:?}", paths.log_file()))?;
    let log_err = log.try_clone()?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .arg("--session")
        .arg(token.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().context("failed to start session daemon")?;
    tracing::debug!("session daemon spawned with pid {}", child.id());
    Ok(())
}

/// Run the session daemon until the shell exits, the idle timeout
/// reaps it, or it is terminated.
pub async fn run_daemon(token: SessionToken, config: SessionConfig) -> Result<()> {
    let paths = SessionPaths::new(config.runtime_dir.as_deref(), &token);
    paths.create()?;

    // Stale sockets from an unclean shutdown would block the bind
    let _ = std::fs::remove_file(paths.control_socket());
    let _ = std::fs::remove_file(paths.agent_socket());
    let control = UnixListener::bind(paths.control_socket())
        .with_context(|| format!("cannot bind {:?}", paths.control_socket()))?;
    let agent = UnixListener::bind(paths.agent_socket())
        .with_context(|| format!("cannot bind {:?}", paths.agent_socket()))?;

    let mux_config = MuxConfig {
        heartbeat_interval: config.heartbeat_interval,
        grace_interval: config.grace_interval,
        resend_buffer_bytes: config.resend_buffer_bytes,
        ..MuxConfig::default()
    };
    let (mux, events) = Mux::new(Side::Server, mux_config);

    let daemon = SessionDaemon {
        token,
        config,
        paths,
        mux: Arc::new(mux),
    };
    daemon.run(control, agent, events).await
}

/// One bound transport
struct TransportBinding {
    cancel: CancellationToken,
    task: JoinHandle<Disconnect>,
}

/// The running shell and its I/O pipeline
struct ShellRuntime {
    pty: PtyShell,
    reader_cancel: CancellationToken,
    /// Completes once all PTY output has been pushed into the terminal
    /// channel (reader hit end-of-file and the queue drained)
    forwarder: JoinHandle<()>,
}

/// Terminal channel halves, handed to the shell pipeline at first attach
struct TerminalIo {
    tx: ChannelSender,
    rx: ChannelReceiver,
}

struct SessionDaemon {
    token: SessionToken,
    config: SessionConfig,
    paths: SessionPaths,
    mux: Arc<Mux>,
}

impl SessionDaemon {
    async fn run(
        self,
        control: UnixListener,
        agent: UnixListener,
        mut events: mpsc::Receiver<MuxEvent>,
    ) -> Result<()> {
        let terminal = self.mux.take_terminal().expect("terminal channel taken once");
        let (term_tx, term_rx) = terminal.split();
        let mut terminal_io = Some(TerminalIo {
            tx: term_tx,
            rx: term_rx,
        });

        let mut shell: Option<ShellRuntime> = None;
        let mut binding: Option<TransportBinding> = None;
        let mut last_unbound = Instant::now();

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sigterm = signal(SignalKind::terminate())?;

        tracing::info!("session {} ready on {:?}", self.token, self.paths.dir());

        loop {
            tokio::select! {
                accepted = control.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            tracing::warn!("control accept failed: {}", err);
                            continue;
                        }
                    };

                    // Quiesce the previous binding before the new
                    // transport may write: exactly one transport is
                    // bound at any instant
                    if let Some(old) = binding.take() {
                        tracing::info!("superseding previous transport");
                        old.cancel.cancel();
                        let _ = old.task.await;
                    }

                    match server_accept(stream, &self.token, self.mux.recv_cursor()).await {
                        Ok((framed, hello)) => {
                            if shell.is_none() {
                                let io = terminal_io.take().expect("shell started once");
                                shell = Some(self.start_shell(&hello, io)?);
                            } else if let Some(runtime) = &shell {
                                // Geometry may have changed while detached
                                let _ = runtime.pty.resize(hello.size);
                            }

                            let cancel = CancellationToken::new();
                            let task = tokio::spawn({
                                let mux = Arc::clone(&self.mux);
                                let cancel = cancel.clone();
                                async move { mux.run(framed, hello.recv_cursor, cancel).await }
                            });
                            binding = Some(TransportBinding { cancel, task });
                            tracing::info!("transport bound (client cursor {})", hello.recv_cursor);
                        }
                        Err(err) => tracing::warn!("attach handshake failed: {}", err),
                    }
                }

                accepted = agent.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            // A program in the shell wants the client's
                            // credential agent: server-initiated channel
                            let mux = Arc::clone(&self.mux);
                            tokio::spawn(async move {
                                match mux.open_channel(ChannelKind::ForwardedAgent, None).await {
                                    Ok(channel) => bridge_stream(channel, stream).await,
                                    Err(err) => {
                                        tracing::debug!("agent channel refused: {}", err)
                                    }
                                }
                            });
                        }
                        Err(err) => tracing::warn!("agent accept failed: {}", err),
                    }
                }

                Some(event) = events.recv() => match event {
                    MuxEvent::Resize(size) => {
                        if let Some(runtime) = &shell {
                            if let Err(err) = runtime.pty.resize(size) {
                                tracing::warn!("resize failed: {}", err);
                            }
                        }
                    }
                    MuxEvent::Incoming(incoming) => {
                        tokio::spawn(handle_incoming(incoming));
                    }
                },

                _ = sweep.tick() => {
                    // A binding whose transport died on its own
                    if binding.as_ref().is_some_and(|b| b.task.is_finished()) {
                        let finished = binding.take().expect("checked above");
                        match finished.task.await {
                            Ok(disconnect) => tracing::info!("transport unbound: {}", disconnect),
                            Err(err) => tracing::error!("transport task panicked: {}", err),
                        }
                        last_unbound = Instant::now();
                    }

                    // Shell exit ends the session
                    if let Some(runtime) = shell.as_mut() {
                        match runtime.pty.try_wait() {
                            Ok(Some(exit_code)) => {
                                return self.finish(shell.take().expect("checked"), exit_code, binding).await;
                            }
                            Ok(None) => {}
                            Err(err) => tracing::warn!("shell status check failed: {}", err),
                        }
                    }

                    // Idle reaping bounds leakage from abandoned clients
                    if binding.is_none() && last_unbound.elapsed() > self.config.idle_timeout {
                        tracing::info!(
                            "no transport for {:?}; reaping session",
                            self.config.idle_timeout
                        );
                        return self.teardown(shell);
                    }
                }

                _ = sigterm.recv() => {
                    tracing::info!("terminated; tearing session down");
                    return self.teardown(shell);
                }
            }
        }
    }

    /// Spawn the shell and wire its I/O pipeline:
    /// PTY reader thread -> output queue -> terminal channel, and
    /// terminal channel -> PTY writer.
    fn start_shell(&self, hello: &ClientHello, io: TerminalIo) -> Result<ShellRuntime> {
        let mut pty = PtyShell::spawn(
            self.config.shell.as_deref(),
            &self.config.env,
            &hello.term,
            hello.size,
            Some(&self.paths.agent_socket()),
        )?;

        let meta = SessionMeta::new(self.token.clone(), pty.shell.clone(), pty.pid);
        if let Err(err) = meta.write(&self.paths.metadata()) {
            tracing::warn!("could not write session metadata: {}", err);
        }

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(PTY_OUTPUT_QUEUE);
        let reader_cancel = CancellationToken::new();
        let reader = pty.take_reader()?;
        spawn_pty_reader(reader, output_tx, reader_cancel.clone());

        // Output queue into the terminal channel; backpressure from a
        // full resend buffer stalls this task, then the queue, then the
        // reader thread, then the shell itself, never the daemon loop
        let term_tx = io.tx;
        let forwarder = tokio::spawn(async move {
            while let Some(output) = output_rx.recv().await {
                if term_tx.send(Bytes::from(output)).await.is_err() {
                    tracing::debug!("terminal channel closed; dropping shell output");
                    break;
                }
            }
        });

        // Keystrokes from the terminal channel into the PTY
        let mut writer = pty.take_writer().expect("writer taken once");
        let mut term_rx = io.rx;
        tokio::spawn(async move {
            while let Some(input) = term_rx.recv().await {
                if writer
                    .write_all(&input)
                    .and_then(|_| writer.flush())
                    .is_err()
                {
                    tracing::debug!("PTY writer closed; stopping input task");
                    break;
                }
            }
        });

        Ok(ShellRuntime {
            pty,
            reader_cancel,
            forwarder,
        })
    }

    /// Shell exited: flush remaining output, announce the end, tear down.
    async fn finish(
        self,
        runtime: ShellRuntime,
        exit_code: i32,
        binding: Option<TransportBinding>,
    ) -> Result<()> {
        tracing::info!("shell exited with code {}", exit_code);

        // The reader hits end-of-file after shell exit; once the
        // forwarder finishes, every byte of output is in the channel
        let _ = tokio::time::timeout(Duration::from_secs(2), runtime.forwarder).await;
        tokio::time::sleep(END_FLUSH_GRACE).await;

        let _ = self.mux.send_session_end(Some(exit_code)).await;
        tokio::time::sleep(END_FLUSH_GRACE).await;

        if let Some(binding) = binding {
            binding.cancel.cancel();
            let _ = binding.task.await;
        }
        runtime.reader_cancel.cancel();

        self.paths
            .remove()
            .with_context(|| "failed to remove session directory")?;
        tracing::info!("session {} ended", self.token);
        Ok(())
    }

    /// Kill the shell (if any) and remove every trace of the session.
    fn teardown(&self, shell: Option<ShellRuntime>) -> Result<()> {
        if let Some(mut runtime) = shell {
            runtime.reader_cancel.cancel();
            let exit = runtime.pty.kill();
            tracing::info!("shell killed (exit {:?})", exit);
        }
        self.paths
            .remove()
            .with_context(|| "failed to remove session directory")?;
        tracing::info!("session {} reaped", self.token);
        Ok(())
    }
}

/// Serve one peer-opened channel: connect a forwarded-port target and
/// bridge it, or refuse kinds the daemon cannot serve.
async fn handle_incoming(incoming: IncomingChannel) {
    match incoming.kind() {
        ChannelKind::ForwardedPort => {
            let Some(target) = incoming.target().cloned() else {
                let _ = incoming.reject("forward target missing").await;
                return;
            };
            match tokio::net::TcpStream::connect((target.host.clone(), target.port)).await {
                Ok(stream) => {
                    if let Ok(channel) = incoming.accept().await {
                        tracing::debug!("forwarding to {}", target);
                        bridge_stream(channel, stream).await;
                        tracing::debug!("forward to {} finished", target);
                    }
                }
                Err(err) => {
                    let _ = incoming
                        .reject(format!("connect to {} failed: {}", target, err))
                        .await;
                }
            }
        }
        other => {
            let _ = incoming
                .reject(format!("cannot serve {:?} channel", other))
                .await;
        }
    }
}

/// Blocking task reading the PTY master into the output queue.
///
/// Uses a `CancellationToken` checked between reads for shutdown; the
/// normal exit path is end-of-file when the shell terminates.
fn spawn_pty_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];

        loop {
            if cancel.is_cancelled() {
                tracing::debug!("PTY reader cancelled");
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader end-of-file");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        tracing::debug!("PTY output queue closed");
                        break;
                    }
                }
                Err(err) => {
                    // Linux reports EIO on the master once the shell
                    // exits; treat it like end-of-file
                    if !cancel.is_cancelled() {
                        tracing::debug!("PTY reader finished: {}", err);
                    }
                    break;
                }
            }
        }
    })
}
