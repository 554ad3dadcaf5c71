//! Holdfast session manager binary
//!
//! `attach` runs once per transport (invoked over the remote-login
//! mechanism) and bridges stdio to the session daemon; `daemon` is the
//! detached per-session manager; `list` shows live sessions.
//!
//! Logs go to stderr: for `attach` that reaches the user's terminal via
//! the transport (warnings only by default), while the daemon's stderr
//! is redirected to the session log file by its spawner.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hf_core::config::{self, SessionConfig};
use hf_core::time::elapsed_duration;
use hf_protocol::SessionToken;

use hf_session::meta::SessionMeta;
use hf_session::{attach, daemon, paths};

#[derive(Parser)]
#[command(name = "holdfast-session")]
#[command(about = "Holdfast session manager - detached resumable shell sessions")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach this process's stdio to a session as one transport
    Attach {
        /// Session token to attach to
        #[arg(short, long)]
        session: String,

        /// Create the session if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Run the detached session daemon (started by attach, not by hand)
    #[command(hide = true)]
    Daemon {
        /// Session token to manage
        #[arg(short, long)]
        session: String,
    },

    /// List live sessions on this host
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The attach bridge carries protocol frames on stdout, so logging
    // stays on stderr and defaults to quiet; the daemon's stderr is its
    // log file, so it defaults to chatty
    let default_level = match cli.command {
        Command::Daemon { .. } => "info",
        _ => "warn",
    };
    let log_level = cli.log_level.as_deref().unwrap_or(default_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("session.toml"));
    let session_config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|err| {
            tracing::warn!("failed to load config from {:?}: {}", config_path, err);
            SessionConfig::default()
        })
    } else {
        SessionConfig::default()
    };

    match cli.command {
        Command::Attach { session, create } => {
            let token = parse_token(&session)?;
            attach::run_attach(token, create, session_config, cli.config.as_deref()).await
        }

        Command::Daemon { session } => {
            let token = parse_token(&session)?;
            daemon::run_daemon(token, session_config).await
        }

        Command::List => list_sessions(&session_config),
    }
}

fn parse_token(raw: &str) -> Result<SessionToken> {
    SessionToken::parse(raw)
        .with_context(|| format!("invalid session token: {:?} (alphanumeric only)", raw))
}

fn list_sessions(config: &SessionConfig) -> Result<()> {
    let sessions = paths::list_sessions(config.runtime_dir.as_deref())?;
    if sessions.is_empty() {
        println!("no live sessions");
        return Ok(());
    }

    for (token, session_paths) in sessions {
        match SessionMeta::read(&session_paths.metadata()) {
            Ok(meta) => {
                let age = elapsed_duration(meta.created_at);
                println!(
                    "{}  shell {} (pid {})  daemon {}  up {}s",
                    token,
                    meta.shell,
                    meta.shell_pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    meta.daemon_pid,
                    age.as_secs(),
                );
            }
            Err(_) => {
                // Daemon spawned but shell not started yet, or stale dir
                println!("{}  (no metadata)", token);
            }
        }
    }
    Ok(())
}
