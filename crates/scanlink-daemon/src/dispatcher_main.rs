//! Dispatcher daemon.
//!
//! Accepts the scanner's WebSocket and relays `scan` commands typed on stdin,
//! saving each returned image with an empty description that `note <text>`
//! lines append to:
//!
//!   scanlink-dispatcher --listen 0.0.0.0:8765 --output-dir scans/images

use anyhow::Context;
use clap::Parser;
use scanlink_daemon::config::{Config, DispatcherSection};
use scanlink_daemon::console::{Console, announce};
use scanlink_daemon::store::ScanStore;
use scanlink_daemon::{logging, shutdown_signal};
use scanlink_dispatcher::{Dispatcher, UnsolicitedPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "scanlink-dispatcher", version, about = "Relay scan commands to a capture device")]
struct Cli {
    /// Config file (defaults to ./scanlink.toml when present)
    #[arg(short, long, env = "SCANLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept the device on
    #[arg(long, env = "SCANLINK_LISTEN")]
    listen: Option<SocketAddr>,

    /// Seconds to wait for an image
    #[arg(long, env = "SCANLINK_SCAN_TIMEOUT")]
    scan_timeout: Option<u64>,

    /// What to do with payloads nobody asked for: discard or retain
    #[arg(long, env = "SCANLINK_UNSOLICITED")]
    unsolicited: Option<UnsolicitedPolicy>,

    /// Directory for received images
    #[arg(long, env = "SCANLINK_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Directory for image descriptions
    #[arg(long, env = "SCANLINK_NOTES_DIR")]
    notes_dir: Option<PathBuf>,

    /// Run without reading commands from stdin
    #[arg(long)]
    no_console: bool,
}

impl Cli {
    fn apply(&self, section: &mut DispatcherSection) {
        if let Some(listen) = self.listen {
            section.listen = listen;
        }
        if let Some(secs) = self.scan_timeout {
            section.scan_timeout_secs = secs;
        }
        if let Some(policy) = self.unsolicited {
            section.unsolicited = policy;
        }
        if let Some(dir) = &self.output_dir {
            section.output_dir = dir.clone();
        }
        if let Some(dir) = &self.notes_dir {
            section.notes_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config.dispatcher);
    let section = config.dispatcher;
    section.validate()?;

    let store = ScanStore::new(&section.output_dir, &section.notes_dir);
    store.ensure_dirs().await.with_context(|| {
        format!(
            "creating {} and {}",
            section.output_dir.display(),
            section.notes_dir.display()
        )
    })?;

    let dispatcher = Dispatcher::bind(section.dispatcher_config())
        .await
        .with_context(|| format!("binding {}", section.listen))?;
    let correlator = dispatcher.correlator();
    let connected = dispatcher.manager().registry().watch();
    tokio::spawn(announce(connected.clone()));

    tracing::info!(
        scan_timeout_secs = section.scan_timeout_secs,
        unsolicited = ?section.unsolicited,
        output_dir = %section.output_dir.display(),
        notes_dir = %section.notes_dir.display(),
        "dispatcher starting"
    );
    let server = tokio::spawn(dispatcher.serve(shutdown_signal()));

    if cli.no_console {
        server.await??;
        return Ok(());
    }

    let mut console = Console::new(correlator, connected, store, section.scan_timeout());
    console
        .restore_last_note()
        .await
        .with_context(|| format!("reading {}", section.notes_dir.display()))?;
    tokio::select! {
        result = console.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => result?,
        result = server => result??,
    }
    Ok(())
}
