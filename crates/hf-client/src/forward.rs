//! Local forwarding
//!
//! Port forwards: one local listener per `-L` spec; every accepted
//! connection opens its own forwarded-port channel and streams until the
//! connection ends. One forward breaking never touches the terminal or
//! the other forwards.
//!
//! Agent forwards arrive from the other direction: the session daemon
//! opens a forwarded-agent channel whenever a remote program connects to
//! the session's SSH_AUTH_SOCK; we bridge it to the local agent if the
//! user enabled `-A`, and reject it otherwise.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hf_mux::{bridge_stream, IncomingChannel, Mux, MuxEvent};
use hf_protocol::{ChannelKind, ForwardTarget};

/// One `-L [bind_address:]port:host:hostport` forwarding specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Local address to listen on
    pub bind_address: String,
    /// Local port to listen on
    pub bind_port: u16,
    /// Remote target, connected from the session host
    pub target: ForwardTarget,
}

/// Errors parsing a forward specification
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ForwardSpecError {
    #[error("expected [bind_address:]port:host:hostport, got {0:?}")]
    Malformed(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

impl FromStr for ForwardSpec {
    type Err = ForwardSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (bind_address, port_str, host, hostport_str) = match parts.as_slice() {
            [port, host, hostport] => ("127.0.0.1", *port, *host, *hostport),
            [bind, port, host, hostport] => (*bind, *port, *host, *hostport),
            _ => return Err(ForwardSpecError::Malformed(s.to_string())),
        };

        let bind_port = port_str
            .parse()
            .map_err(|_| ForwardSpecError::InvalidPort(s.to_string()))?;
        let port = hostport_str
            .parse()
            .map_err(|_| ForwardSpecError::InvalidPort(s.to_string()))?;
        if host.is_empty() {
            return Err(ForwardSpecError::Malformed(s.to_string()));
        }

        Ok(Self {
            bind_address: bind_address.to_string(),
            bind_port,
            target: ForwardTarget {
                host: host.to_string(),
                port,
            },
        })
    }
}

/// Bind the local listener for one forward spec and serve connections
/// until aborted.
pub async fn spawn_forward_listener(
    mux: Arc<Mux>,
    spec: ForwardSpec,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind((spec.bind_address.as_str(), spec.bind_port)).await?;
    tracing::info!(
        "forwarding {}:{} -> {}",
        spec.bind_address,
        spec.bind_port,
        spec.target
    );

    Ok(tokio::spawn(async move {
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("forward accept failed: {}", err);
                    continue;
                }
            };
            tracing::debug!("forward connection from {}", peer);

            let mux = Arc::clone(&mux);
            let target = spec.target.clone();
            tokio::spawn(async move {
                match mux
                    .open_channel(ChannelKind::ForwardedPort, Some(target.clone()))
                    .await
                {
                    Ok(channel) => bridge_stream(channel, conn).await,
                    Err(err) => {
                        // Only this connection is affected
                        tracing::warn!("forward to {} refused: {}", target, err);
                    }
                }
            });
        }
    }))
}

/// Handle session events on the client side: agent-forward opens, plus
/// anything unexpected.
pub fn spawn_event_handler(
    mut events: mpsc::Receiver<MuxEvent>,
    forward_agent: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MuxEvent::Incoming(incoming) => {
                    tokio::spawn(handle_incoming(incoming, forward_agent));
                }
                MuxEvent::Resize(_) => {
                    // Geometry flows client -> daemon only
                    tracing::debug!("ignoring resize from the session side");
                }
            }
        }
    })
}

async fn handle_incoming(incoming: IncomingChannel, forward_agent: bool) {
    match incoming.kind() {
        ChannelKind::ForwardedAgent => {
            if !forward_agent {
                let _ = incoming.reject("agent forwarding not enabled").await;
                return;
            }
            let Ok(sock) = std::env::var("SSH_AUTH_SOCK") else {
                let _ = incoming.reject("no local agent (SSH_AUTH_SOCK unset)").await;
                return;
            };
            match UnixStream::connect(&sock).await {
                Ok(stream) => {
                    if let Ok(channel) = incoming.accept().await {
                        tracing::debug!("agent connection bridged");
                        bridge_stream(channel, stream).await;
                    }
                }
                Err(err) => {
                    let _ = incoming
                        .reject(format!("local agent unreachable: {}", err))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_part_spec() {
        let spec: ForwardSpec = "8080:localhost:80".parse().unwrap();
        assert_eq!(spec.bind_address, "127.0.0.1");
        assert_eq!(spec.bind_port, 8080);
        assert_eq!(spec.target.host, "localhost");
        assert_eq!(spec.target.port, 80);
    }

    #[test]
    fn test_parse_four_part_spec() {
        let spec: ForwardSpec = "0.0.0.0:5433:db.internal:5432".parse().unwrap();
        assert_eq!(spec.bind_address, "0.0.0.0");
        assert_eq!(spec.bind_port, 5433);
        assert_eq!(spec.target.to_string(), "db.internal:5432");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "nope".parse::<ForwardSpec>(),
            Err(ForwardSpecError::Malformed(_))
        ));
        assert!(matches!(
            "80:host".parse::<ForwardSpec>(),
            Err(ForwardSpecError::Malformed(_))
        ));
        assert!(matches!(
            "eighty:host:80".parse::<ForwardSpec>(),
            Err(ForwardSpecError::InvalidPort(_))
        ));
    }
}
