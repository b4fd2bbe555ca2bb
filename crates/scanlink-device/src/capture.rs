//! Capture providers.
//!
//! The agent does not talk to camera hardware itself. It calls a
//! [`CaptureProvider`], which returns the encoded image bytes.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

/// Something that can produce one image on demand.
pub trait CaptureProvider: Send + Sync + 'static {
    fn capture(&self) -> impl Future<Output = Result<Vec<u8>, CaptureError>> + Send;
}

/// Why a capture produced no image.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture command exited with {status}: {stderr}")]
    CommandFailed { status: ExitStatus, stderr: String },
    #[error("capture produced no data")]
    Empty,
    #[error("capture timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(String),
}

/// Reads the image from a file on every capture.
///
/// Useful with devices that keep overwriting a snapshot file, and in tests.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CaptureProvider for FileCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

/// Runs an external program and takes its stdout as the image,
/// e.g. `fswebcam --no-banner -`.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl CaptureProvider for CommandCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        // kill_on_drop so an agent-side timeout also stops the child.
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CaptureError::CommandFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn file_capture_reads_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();

        let capture = FileCapture::new(file.path());
        assert_eq!(capture.capture().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn file_capture_missing_file() {
        let capture = FileCapture::new("/nonexistent/scanlink/snapshot.png");
        assert!(matches!(capture.capture().await, Err(CaptureError::Io(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_capture_takes_stdout() {
        let capture = CommandCapture::new("sh", vec!["-c".into(), "printf abc".into()]);
        assert_eq!(capture.capture().await.unwrap(), b"abc".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_capture_reports_failure() {
        let capture = CommandCapture::new(
            "sh",
            vec!["-c".into(), "echo no camera >&2; exit 3".into()],
        );
        match capture.capture().await {
            Err(CaptureError::CommandFailed { status, stderr }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "no camera");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
