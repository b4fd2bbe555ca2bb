use std::time::Duration;

/// Terminal outcome of a failed scan request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("no device connected")]
    NoActiveConnection,
    #[error("sending the scan command failed: {0}")]
    SendFailed(String),
    #[error("another scan is already in progress")]
    Busy,
    #[error("device reported a capture failure: {0}")]
    Capture(String),
    #[error("no image arrived within {0:?}")]
    Timeout(Duration),
}
