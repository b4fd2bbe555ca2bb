//! Core types for scanlink.
//!
//! This crate provides the protocol primitives shared by the device agent and
//! the dispatcher: the command and payload framing, the device report type,
//! connection state, and the reconnect policy.

mod message;
mod retry;

pub use message::{Command, CommandKind, DeviceReport, PAYLOAD_MAGIC, Payload, RequestId};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state, as seen by the device agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection, possibly waiting to reconnect.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Normal operation.
    Connected,
}

impl ConnectionState {
    /// Whether commands can currently flow.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}
