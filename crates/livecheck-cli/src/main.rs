//! `livecheck`: command-line client for the livecheck daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use livecheck_core::Protocol;

mod simulate;

#[zbus::proxy(
    interface = "org.freedesktop.Livecheck1",
    default_service = "org.freedesktop.Livecheck1",
    default_path = "/org/freedesktop/Livecheck1"
)]
trait Livecheck {
    async fn start_challenge(&self, protocol: &str) -> zbus::Result<u64>;
    async fn cancel_challenge(&self) -> zbus::Result<bool>;
    async fn reset_challenge(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn captured_photo(&self) -> zbus::Result<(u64, String, u32, u32, Vec<u8>)>;
    async fn recent_sessions(&self, limit: u32) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "livecheck", version, about = "Active liveness challenges")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a challenge (smile-neutral | turn-left-right-center)
    Start { protocol: Protocol },
    /// Cancel the challenge in progress
    Cancel,
    /// Clear the current session and return to idle
    Reset,
    /// Show daemon and session status
    Status,
    /// Show the liveness photo metadata of the last completed session
    Photo,
    /// List recently finished sessions
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Replay a recorded oracle trace through the challenge offline
    Simulate {
        /// JSON-lines trace file
        trace: PathBuf,
        #[arg(long, default_value = "smile-neutral")]
        protocol: Protocol,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        #[arg(long, default_value_t = 1)]
        debounce: u32,
        #[arg(long, default_value_t = 15)]
        step_timeout_secs: u64,
    },
}

async fn connect(session_bus: bool) -> Result<LivecheckProxy<'static>> {
    tracing::debug!(session_bus, "connecting to livecheckd");
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    LivecheckProxy::new(&conn)
        .await
        .context("livecheckd is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            trace,
            protocol,
            interval_ms,
            debounce,
            step_timeout_secs,
        } => simulate::run(
            &trace,
            simulate::SimulateOptions {
                protocol,
                interval: Duration::from_millis(interval_ms.max(1)),
                debounce_samples: debounce,
                step_timeout: Duration::from_secs(step_timeout_secs),
            },
        ),
        Command::Start { protocol } => {
            let proxy = connect(cli.session_bus).await?;
            let session = proxy.start_challenge(protocol.as_str()).await?;
            println!("Started session {session} ({protocol})");
            Ok(())
        }
        Command::Cancel => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.cancel_challenge().await? {
                println!("Challenge cancelled.");
            } else {
                println!("No challenge in progress.");
            }
            Ok(())
        }
        Command::Reset => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.reset_challenge().await? {
                println!("Session cleared.");
            } else {
                println!("Already idle.");
            }
            Ok(())
        }
        Command::Status => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.status().await?)
        }
        Command::Photo => {
            let proxy = connect(cli.session_bus).await?;
            let (session, captured_at, width, height, data) = proxy.captured_photo().await?;
            println!(
                "Session {session}: {width}x{height}, {} bytes, captured {captured_at}",
                data.len()
            );
            Ok(())
        }
        Command::History { limit } => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.recent_sessions(limit).await?)
        }
    }
}
