//! Device daemon.
//!
//! Keeps a connection to the dispatcher and captures an image per command:
//!
//!   scanlink-device --url ws://dispatcher.local:8765
//!   scanlink-device --url ws://127.0.0.1:8765 --capture-file /tmp/latest.png

use clap::Parser;
use scanlink_daemon::config::{CaptureSection, Config, DeviceSection};
use scanlink_daemon::{logging, shutdown_signal};
use scanlink_device::DeviceAgent;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "scanlink-device", version, about = "Capture images on request from a dispatcher")]
struct Cli {
    /// Config file (defaults to ./scanlink.toml when present)
    #[arg(short, long, env = "SCANLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Dispatcher WebSocket URL
    #[arg(long, env = "SCANLINK_URL")]
    url: Option<String>,

    /// Serve this file instead of running a capture command
    #[arg(long, env = "SCANLINK_CAPTURE_FILE")]
    capture_file: Option<PathBuf>,

    /// Seconds a single capture may take
    #[arg(long, env = "SCANLINK_CAPTURE_TIMEOUT")]
    capture_timeout: Option<u64>,

    /// Milliseconds between reconnect attempts
    #[arg(long, env = "SCANLINK_RECONNECT_DELAY_MS")]
    reconnect_delay_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, section: &mut DeviceSection) {
        if let Some(url) = &self.url {
            section.url = url.clone();
        }
        if let Some(path) = &self.capture_file {
            section.capture = CaptureSection::File { path: path.clone() };
        }
        if let Some(secs) = self.capture_timeout {
            section.capture_timeout_secs = secs;
        }
        if let Some(ms) = self.reconnect_delay_ms {
            section.reconnect.delay_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config.device);
    let section = config.device;
    section.validate()?;

    tracing::info!(url = %section.url, capture = ?section.capture, "device agent starting");
    let agent = DeviceAgent::new(section.agent_config(), section.capture.provider());

    let mut events = agent.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(state) => tracing::info!(%state, "connectivity"),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "connectivity events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    agent.run(shutdown_signal()).await?;
    Ok(())
}
