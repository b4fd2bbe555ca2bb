use scanlink_device::{CaptureError, CaptureProvider, CommandCapture, FileCapture};

/// Capture provider chosen at startup from `[device.capture]`.
#[derive(Debug, Clone)]
pub enum ConfiguredCapture {
    File(FileCapture),
    Command(CommandCapture),
}

impl CaptureProvider for ConfiguredCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        match self {
            Self::File(file) => file.capture().await,
            Self::Command(command) => command.capture().await,
        }
    }
}
