//! Protocol messages.
//!
//! Commands and device reports travel as JSON text frames. Payloads travel as
//! binary frames: either the raw capture bytes, or the bytes prefixed with a
//! fixed header carrying the request id they answer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token tying a payload or report to the command that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The only instruction a device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Scan,
}

/// Dispatcher -> device command, e.g. `{"cmd":"scan","id":7}`.
///
/// Without an id the frame is exactly `{"cmd":"scan"}`, which is what older
/// devices expect. Devices that ignore the id answer with untagged payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub cmd: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Command {
    /// A scan command carrying a correlation token.
    pub fn scan(id: RequestId) -> Self {
        Self {
            cmd: CommandKind::Scan,
            id: Some(id),
        }
    }

    /// A bare scan command with no token.
    pub fn untagged_scan() -> Self {
        Self {
            cmd: CommandKind::Scan,
            id: None,
        }
    }

    /// Parse a text frame. Anything that is not a recognized command shape
    /// yields `None` and is meant to be ignored by the receiver.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> String {
        // A struct of a unit enum and an optional integer always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"cmd":"scan"}"#))
    }
}

/// Device -> dispatcher structured notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceReport {
    /// The capture for `id` failed or timed out on the device.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        message: String,
    },
}

impl DeviceReport {
    pub fn error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            message: message.into(),
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"cmd":"error"}"#))
    }
}

/// Magic prefix marking a tagged payload frame.
pub const PAYLOAD_MAGIC: [u8; 4] = *b"SCN\x01";

const HEADER_LEN: usize = PAYLOAD_MAGIC.len() + 8;

/// Capture result sent device -> dispatcher as one binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    id: Option<RequestId>,
    data: Vec<u8>,
}

impl Payload {
    /// A payload answering a specific request.
    pub fn tagged(id: RequestId, data: Vec<u8>) -> Self {
        Self { id: Some(id), data }
    }

    /// Raw bytes with no header; matched by arrival order.
    pub fn untagged(data: Vec<u8>) -> Self {
        Self { id: None, data }
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encode into a binary frame body.
    pub fn encode(self) -> Vec<u8> {
        match self.id {
            None => self.data,
            Some(id) => {
                let mut frame = Vec::with_capacity(HEADER_LEN + self.data.len());
                frame.extend_from_slice(&PAYLOAD_MAGIC);
                frame.extend_from_slice(&id.get().to_be_bytes());
                frame.extend_from_slice(&self.data);
                frame
            }
        }
    }

    /// Decode a binary frame body. Frames without the magic prefix, or too
    /// short to hold the header, are taken as untagged raw bytes.
    pub fn decode(mut frame: Vec<u8>) -> Self {
        if frame.len() < HEADER_LEN || !frame.starts_with(&PAYLOAD_MAGIC) {
            return Self::untagged(frame);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame[PAYLOAD_MAGIC.len()..HEADER_LEN]);
        frame.drain(..HEADER_LEN);
        Self::tagged(RequestId::new(u64::from_be_bytes(raw)), frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_scan_matches_legacy_frame() {
        assert_eq!(Command::untagged_scan().to_json(), r#"{"cmd":"scan"}"#);
        assert_eq!(
            Command::parse(r#"{"cmd":"scan"}"#),
            Some(Command::untagged_scan())
        );
    }

    #[test]
    fn tagged_scan_carries_id() {
        let cmd = Command::scan(RequestId::new(7));
        assert_eq!(cmd.to_json(), r#"{"cmd":"scan","id":7}"#);
        assert_eq!(Command::parse(&cmd.to_json()), Some(cmd));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        assert_eq!(Command::parse(r#"{"cmd":"reboot"}"#), None);
        assert_eq!(Command::parse(r#"{"kind":"scan"}"#), None);
        assert_eq!(Command::parse("scan"), None);
        assert_eq!(Command::parse(r#"{"cmd":"scan","extra":1}"#), None);
        assert_eq!(Command::parse(r#"{"cmd":"scan","id":2,"force":true}"#), None);
    }

    #[test]
    fn device_report_shape() {
        let report = DeviceReport::error(Some(RequestId::new(3)), "camera busy");
        assert_eq!(
            report.to_json(),
            r#"{"cmd":"error","id":3,"message":"camera busy"}"#
        );
        assert_eq!(DeviceReport::parse(&report.to_json()), Some(report));
        assert_eq!(DeviceReport::parse(r#"{"cmd":"scan"}"#), None);
    }

    #[test]
    fn tagged_payload_header() {
        let frame = Payload::tagged(RequestId::new(0x0102), vec![0xAA, 0xBB]).encode();
        assert_eq!(&frame[..4], b"SCN\x01");
        assert_eq!(&frame[4..12], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&frame[12..], &[0xAA, 0xBB]);

        let payload = Payload::decode(frame);
        assert_eq!(payload.id(), Some(RequestId::new(0x0102)));
        assert_eq!(payload.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn raw_png_is_untagged() {
        let png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        let payload = Payload::decode(png.clone());
        assert_eq!(payload.id(), None);
        assert_eq!(payload.into_data(), png);
    }

    #[test]
    fn short_frame_with_magic_is_untagged() {
        let payload = Payload::decode(b"SCN\x01abc".to_vec());
        assert_eq!(payload.id(), None);
        assert_eq!(payload.len(), 7);
    }
}
