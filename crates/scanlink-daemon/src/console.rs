//! Line-oriented command source for the dispatcher.
//!
//! Reads `scan`, `note <text>`, `status` and `quit` from an input stream, one
//! per line, and writes a reply for each. Notes go to the description file of
//! the latest scan.

use crate::store::ScanStore;
use scanlink_dispatcher::{CommandSink, Correlator, ScanError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

pub struct Console<S> {
    correlator: Arc<Correlator<S>>,
    connected: watch::Receiver<Option<SocketAddr>>,
    store: ScanStore,
    deadline: Duration,
    last_note: Option<PathBuf>,
}

impl<S: CommandSink> Console<S> {
    pub fn new(
        correlator: Arc<Correlator<S>>,
        connected: watch::Receiver<Option<SocketAddr>>,
        store: ScanStore,
        deadline: Duration,
    ) -> Self {
        Self {
            correlator,
            connected,
            store,
            deadline,
            last_note: None,
        }
    }

    /// Pick up the newest description left by a previous run.
    pub async fn restore_last_note(&mut self) -> std::io::Result<()> {
        self.last_note = self.store.latest_note().await?;
        if let Some(note) = &self.last_note {
            tracing::info!(path = %note.display(), "last description restored");
        }
        Ok(())
    }

    pub fn last_note(&self) -> Option<&PathBuf> {
        self.last_note.as_ref()
    }

    /// Serve commands until `quit` or end of input.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
            let reply = match word {
                "" => continue,
                "scan" | "/scan" => self.scan().await,
                "note" | "/note" => self.note(rest.trim()).await,
                "status" | "/status" => self.status(),
                "quit" | "exit" => break,
                _ => format!("unknown command {line:?}, try scan, note, status or quit"),
            };
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok(())
    }

    async fn scan(&mut self) -> String {
        match self.correlator.request_scan(self.deadline).await {
            Ok(data) => match self.store.save(&data).await {
                Ok(saved) => {
                    let reply = format!("saved {} ({} bytes)", saved.image.display(), data.len());
                    self.last_note = Some(saved.note);
                    reply
                }
                Err(e) => {
                    tracing::error!(error = %e, dir = %self.store.images_dir().display(), "saving image");
                    format!("image received but not saved: {e}")
                }
            },
            Err(ScanError::NoActiveConnection) => String::from("scanner not connected"),
            Err(ScanError::Timeout(deadline)) => {
                format!("no image arrived within {}s", deadline.as_secs())
            }
            Err(e) => format!("scan failed: {e}"),
        }
    }

    async fn note(&self, text: &str) -> String {
        let Some(note) = &self.last_note else {
            return String::from("no scans to describe yet");
        };
        if text.is_empty() {
            return String::from("usage: note <text>");
        }
        match self.store.append_note(note, text).await {
            Ok(contents) => {
                let name = note.file_name().unwrap_or_default().to_string_lossy();
                format!("updated {name}:\n{}", contents.trim_end())
            }
            Err(e) => {
                tracing::error!(error = %e, path = %note.display(), "appending description");
                format!("could not update description: {e}")
            }
        }
    }

    fn status(&self) -> String {
        match *self.connected.borrow() {
            Some(peer) => format!("scanner connected from {peer}"),
            None => String::from("scanner not connected"),
        }
    }
}

/// Log every connect and disconnect of the device.
pub async fn announce(mut connected: watch::Receiver<Option<SocketAddr>>) {
    while connected.changed().await.is_ok() {
        match *connected.borrow_and_update() {
            Some(peer) => tracing::info!(%peer, "scanner connected"),
            None => tracing::info!("scanner disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use scanlink_core::{Command, Payload};
    use scanlink_dispatcher::{ConnectionManager, Dispatcher, DispatcherConfig};
    use tokio_tungstenite::tungstenite::Message;

    async fn dispatcher() -> Dispatcher {
        let config = DispatcherConfig {
            listen: ([127, 0, 0, 1], 0).into(),
            ..DispatcherConfig::default()
        };
        Dispatcher::bind(config).await.unwrap()
    }

    fn console(dispatcher: &Dispatcher, dir: &std::path::Path) -> Console<ConnectionManager> {
        Console::new(
            dispatcher.correlator(),
            dispatcher.manager().registry().watch(),
            ScanStore::new(dir.join("images"), dir.join("descriptions")),
            Duration::from_secs(5),
        )
    }

    async fn replies(console: &mut Console<ConnectionManager>, input: &str) -> Vec<String> {
        let mut output = Vec::new();
        console.run(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn replies_without_device() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher().await;
        let mut console = console(&dispatcher, dir.path());

        let lines = replies(&mut console, "status\n\nscan\nnote hi\nfoo\nquit\nscan\n").await;
        assert_eq!(
            lines,
            vec![
                "scanner not connected",
                "scanner not connected",
                "no scans to describe yet",
                "unknown command \"foo\", try scan, note, status or quit",
            ]
        );
    }

    #[tokio::test]
    async fn notes_go_to_restored_description() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("descriptions");
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(notes.join("1700000000000.txt"), "").unwrap();
        std::fs::write(notes.join("1700000000900.txt"), "first line\n").unwrap();

        let dispatcher = dispatcher().await;
        let mut console = console(&dispatcher, dir.path());
        console.restore_last_note().await.unwrap();
        assert_eq!(console.last_note(), Some(&notes.join("1700000000900.txt")));

        let lines = replies(&mut console, "note\nnote   second line  \n").await;
        assert_eq!(
            lines,
            vec![
                "usage: note <text>",
                "updated 1700000000900.txt:",
                "first line",
                "second line",
            ]
        );
        assert_eq!(
            std::fs::read_to_string(notes.join("1700000000000.txt")).unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn scan_saves_image_and_starts_new_description() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::create_dir_all(dir.path().join("descriptions")).unwrap();
        let dispatcher = dispatcher().await;
        let url = format!("ws://{}", dispatcher.local_addr().unwrap());
        let mut connected = dispatcher.manager().registry().watch();
        let mut console = console(&dispatcher, dir.path());
        tokio::spawn(dispatcher.serve(std::future::pending()));

        let (mut device, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        connected.wait_for(|peer| peer.is_some()).await.unwrap();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = device.next().await {
                let Message::Text(text) = msg else { continue };
                if let Some(Command { id: Some(id), .. }) = Command::parse(text.as_str()) {
                    let frame = Payload::tagged(id, b"\x89PNG\r\n\x1a\nimage".to_vec()).encode();
                    device.send(Message::Binary(frame.into())).await.unwrap();
                }
            }
        });

        let lines = replies(&mut console, "scan\nnote kitchen shelf\n").await;
        assert_eq!(lines.len(), 3, "{lines:?}");
        assert!(lines[0].starts_with("saved ") && lines[0].ends_with(".png (13 bytes)"), "{}", lines[0]);
        assert!(lines[1].starts_with("updated ") && lines[1].ends_with(".txt:"), "{}", lines[1]);
        assert_eq!(lines[2], "kitchen shelf");

        let note = console.last_note().unwrap().clone();
        assert_eq!(note.parent(), Some(dir.path().join("descriptions").as_path()));
        assert_eq!(std::fs::read_to_string(note).unwrap(), "kitchen shelf\n");
    }
}
