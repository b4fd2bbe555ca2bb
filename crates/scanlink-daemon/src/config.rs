//! `scanlink.toml` loading.
//!
//! Every key is optional. A missing file yields the defaults, which match a
//! dispatcher on port 8765 and a device on the same host.
//!
//! ```toml
//! [dispatcher]
//! listen = "0.0.0.0:8765"
//! scan_timeout_secs = 15
//! unsolicited = "discard"
//! output_dir = "scans/images"
//! notes_dir = "scans/descriptions"
//!
//! [device]
//! url = "ws://192.168.1.20:8765"
//! capture_timeout_secs = 30
//!
//! [device.reconnect]
//! backoff = "exponential"
//! delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [device.capture]
//! kind = "command"
//! program = "fswebcam"
//! args = ["-q", "--no-banner", "--png", "5", "-"]
//! ```

use crate::provider::ConfiguredCapture;
use scanlink_core::RetryPolicy;
use scanlink_device::{AgentConfig, CommandCapture, FileCapture};
use scanlink_dispatcher::{DispatcherConfig, UnsolicitedPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub dispatcher: DispatcherSection,
    pub device: DeviceSection,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load `path` if given, otherwise `scanlink.toml` in the working
    /// directory if present, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new("scanlink.toml");
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSection {
    pub listen: SocketAddr,
    pub scan_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub unsolicited: UnsolicitedPolicy,
    pub output_dir: PathBuf,
    /// Description files, one per saved image.
    pub notes_dir: PathBuf,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8765).into(),
            scan_timeout_secs: 15,
            send_timeout_secs: 5,
            unsolicited: UnsolicitedPolicy::Discard,
            output_dir: PathBuf::from("scans/images"),
            notes_dir: PathBuf::from("scans/descriptions"),
        }
    }
}

impl DispatcherSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero("dispatcher.scan_timeout_secs", self.scan_timeout_secs)?;
        nonzero("dispatcher.send_timeout_secs", self.send_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            listen: self.listen,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            unsolicited: self.unsolicited,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub url: String,
    pub connect_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    pub reconnect: ReconnectSection,
    pub capture: CaptureSection,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            url: String::from("ws://127.0.0.1:8765"),
            connect_timeout_secs: 10,
            capture_timeout_secs: 30,
            reconnect: ReconnectSection::default(),
            capture: CaptureSection::default(),
        }
    }
}

impl DeviceSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "device.url must be a ws:// or wss:// URL, got {:?}",
                self.url
            )));
        }
        nonzero("device.connect_timeout_secs", self.connect_timeout_secs)?;
        nonzero("device.capture_timeout_secs", self.capture_timeout_secs)?;
        self.reconnect.validate()
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            capture_timeout: Duration::from_secs(self.capture_timeout_secs),
            retry: self.reconnect.policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSection {
    pub backoff: Backoff,
    pub delay_ms: u64,
    /// Growth factor per failed attempt, exponential backoff only.
    pub factor: u32,
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures. Unset retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            backoff: Backoff::Fixed,
            delay_ms: 3000,
            factor: 2,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl ReconnectSection {
    fn validate(&self) -> Result<(), ConfigError> {
        nonzero("device.reconnect.delay_ms", self.delay_ms)?;
        if self.backoff == Backoff::Exponential && self.factor < 2 {
            return Err(ConfigError::Invalid(String::from(
                "device.reconnect.factor must be at least 2 for exponential backoff",
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        let policy = match self.backoff {
            Backoff::Fixed => RetryPolicy::fixed(delay),
            Backoff::Exponential => RetryPolicy::exponential(
                delay,
                self.factor,
                Duration::from_millis(self.max_delay_ms),
            ),
        };
        match self.max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }
}

/// Which capture provider the device uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureSection {
    /// Read a snapshot file.
    File { path: PathBuf },
    /// Run a program and take its stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self::Command {
            program: String::from("fswebcam"),
            args: ["-q", "--no-banner", "--png", "5", "-"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl CaptureSection {
    pub fn provider(&self) -> ConfiguredCapture {
        match self {
            Self::File { path } => ConfiguredCapture::File(FileCapture::new(path)),
            Self::Command { program, args } => {
                ConfiguredCapture::Command(CommandCapture::new(program, args.clone()))
            }
        }
    }
}

fn nonzero(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
    }
    Ok(())
}
