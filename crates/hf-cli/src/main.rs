//! Holdfast client binary
//!
//! `holdfast user@host` opens an interactive shell that survives network
//! interruptions: the remote session lives in a detached daemon, and
//! this client reconnects and resumes it for as long as the user keeps
//! the terminal open. Ctrl-] terminates.
//!
//! Logs go to a file in the state directory; stdout and stderr belong
//! to the raw terminal.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hf_client::{Client, ForwardSpec};
use hf_core::config::{self, ClientConfig};
use hf_protocol::SessionToken;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(about = "Resilient interactive remote shell - survives disconnects and roaming")]
#[command(version)]
struct Args {
    /// Destination: user@host or an ssh config alias
    destination: String,

    /// Local port forward [bind_address:]port:host:hostport (repeatable)
    #[arg(short = 'L', value_name = "SPEC")]
    forward: Vec<String>,

    /// Forward the local credential agent into the session
    #[arg(short = 'A', long)]
    forward_agent: bool,

    /// Resume (or create) a specific session token instead of a fresh one
    #[arg(long, value_name = "TOKEN")]
    session: Option<String>,

    /// Extra option passed through to ssh (repeatable)
    #[arg(short = 'o', value_name = "OPTION")]
    ssh_option: Vec<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;
    tracing::info!("holdfast starting for {}", args.destination);

    // Load configuration, then apply command-line overrides
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut client_config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|err| {
            tracing::warn!("failed to load config from {:?}: {}", config_path, err);
            ClientConfig::default()
        })
    } else {
        ClientConfig::default()
    };
    if args.forward_agent {
        client_config.forward_agent = true;
    }
    for option in &args.ssh_option {
        client_config.ssh_args.push("-o".to_string());
        client_config.ssh_args.push(option.clone());
    }

    let forwards = args
        .forward
        .iter()
        .map(|spec| spec.parse::<ForwardSpec>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid -L forward specification")?;

    let session = args
        .session
        .as_deref()
        .map(|raw| {
            SessionToken::parse(raw)
                .with_context(|| format!("invalid session token: {:?}", raw))
        })
        .transpose()?;

    let client = Client {
        destination: args.destination,
        config: client_config,
        forwards,
        session,
    };

    let exit_code = client.run().await?;
    tracing::info!("holdfast exiting with code {}", exit_code);
    std::process::exit(exit_code);
}

/// Log to a file in the state directory; the terminal is in raw mode
/// and belongs to the remote shell.
fn init_logging(level: &str) -> Result<()> {
    let state_dir = config::default_state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("cannot create state dir {:?}", state_dir))?;
    let log_path = state_dir.join("client.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("cannot open log file {:?}", log_path))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}
