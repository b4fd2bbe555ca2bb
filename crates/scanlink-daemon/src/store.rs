//! Saving received images and their description files.
//!
//! Each image `<unix-millis>.<ext>` gets an empty `<unix-millis>.txt` next to
//! it in the notes directory. Console notes are appended to the latest one.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Paths written for one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedScan {
    pub image: PathBuf,
    pub note: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanStore {
    images: PathBuf,
    notes: PathBuf,
}

impl ScanStore {
    pub fn new(images: impl Into<PathBuf>, notes: impl Into<PathBuf>) -> Self {
        Self {
            images: images.into(),
            notes: notes.into(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    pub fn notes_dir(&self) -> &Path {
        &self.notes
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.images).await?;
        fs::create_dir_all(&self.notes).await
    }

    /// Write the image and create its empty description.
    pub async fn save(&self, data: &[u8]) -> io::Result<SavedScan> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let ext = extension(data);

        // Two scans in the same millisecond get a numeric suffix.
        let mut suffix = 0u32;
        loop {
            let stem = match suffix {
                0 => millis.to_string(),
                n => format!("{millis}-{n}"),
            };
            let image = self.images.join(format!("{stem}.{ext}"));
            match OpenOptions::new().write(true).create_new(true).open(&image).await {
                Ok(mut file) => {
                    file.write_all(data).await?;
                    file.flush().await?;
                    let note = self.notes.join(format!("{stem}.txt"));
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&note)
                        .await?;
                    tracing::info!(path = %image.display(), bytes = data.len(), "image saved");
                    return Ok(SavedScan { image, note });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// The newest description file, if any exist.
    pub async fn latest_note(&self) -> io::Result<Option<PathBuf>> {
        let mut entries = match fs::read_dir(&self.notes).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut latest: Option<((u128, u32), PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "txt") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(stem_order) else {
                continue;
            };
            if latest.as_ref().is_none_or(|(best, _)| key > *best) {
                latest = Some((key, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }

    /// Append one line to a description and return its full contents.
    pub async fn append_note(&self, note: &Path, text: &str) -> io::Result<String> {
        let mut file = OpenOptions::new().append(true).open(note).await?;
        file.write_all(text.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        fs::read_to_string(note).await
    }
}

/// Sort key of a `<millis>[-n]` file stem.
fn stem_order(stem: &str) -> Option<(u128, u32)> {
    match stem.split_once('-') {
        Some((millis, n)) => Some((millis.parse().ok()?, n.parse().ok()?)),
        None => Some((stem.parse().ok()?, 0)),
    }
}

/// File extension guessed from the image magic.
fn extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else {
        "bin"
    }
}
