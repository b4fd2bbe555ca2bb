//! Dispatcher-side connection handling.

use crate::correlator::{CommandSink, Mailbox};
use crate::error::ScanError;
use crate::registry::{ConnectionRegistry, Generation, Outbound};
use futures_util::{SinkExt, StreamExt};
use scanlink_core::{Command, DeviceReport, Payload};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

/// Owns the registry and runs one task per accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    registry: Arc<ConnectionRegistry>,
    mailbox: Mailbox,
    send_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(mailbox: Mailbox, send_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            mailbox,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Complete the WebSocket handshake on a raw TCP stream and serve it.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), tungstenite::Error> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        self.serve_connection(ws, peer).await;
        Ok(())
    }

    /// Serve an established WebSocket until it closes or is superseded.
    pub async fn serve_connection<S>(&self, ws: WebSocketStream<S>, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(8);
        let generation = self.registry.register(peer, outbound_tx);
        tracing::info!(%peer, %generation, "device connected");

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound { message, ack }) => {
                        let result = sink.send(message).await;
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(%peer, %generation, "superseded, closing");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },

                msg = stream.next() => match msg {
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(%peer, ?frame, "device closed the connection");
                        break;
                    }
                    Some(Ok(msg)) => self.on_message(generation, msg),
                    Some(Err(e)) => {
                        tracing::debug!(%peer, error = %e, "websocket error");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.on_close(generation, peer);
    }

    fn on_message(&self, generation: Generation, msg: Message) {
        match msg {
            Message::Binary(data) => {
                let payload = Payload::decode(data.to_vec());
                tracing::debug!(%generation, id = ?payload.id(), bytes = payload.len(), "payload received");
                self.mailbox.deliver(payload);
            }
            Message::Text(text) => match DeviceReport::parse(text.as_str()) {
                Some(DeviceReport::Error { id, message }) => {
                    tracing::warn!(%generation, ?id, %message, "device reported capture failure");
                    self.mailbox.fail(id, message);
                }
                None => {
                    tracing::debug!(%generation, text = text.as_str(), "ignoring text message");
                }
            },
            _ => {}
        }
    }

    fn on_close(&self, generation: Generation, peer: SocketAddr) {
        if self.registry.release(generation) {
            tracing::info!(%peer, %generation, "device disconnected");
        } else {
            tracing::debug!(%peer, %generation, "superseded connection closed");
        }
    }

    /// Treat `generation` as dead and build the error for the caller.
    fn stale(&self, generation: Generation, reason: String) -> ScanError {
        tracing::warn!(%generation, %reason, "send failed, dropping connection");
        self.registry.release(generation);
        ScanError::SendFailed(reason)
    }
}

/// Queue a frame on a connection task and wait for the write result.
async fn write(outbound: &mpsc::Sender<Outbound>, message: Message) -> Result<(), String> {
    let (ack, done) = oneshot::channel();
    outbound
        .send(Outbound { message, ack })
        .await
        .map_err(|_| String::from("connection task has exited"))?;
    match done.await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(String::from("connection closed before the write completed")),
    }
}

impl CommandSink for ConnectionManager {
    async fn send_command(&self, command: Command) -> Result<(), ScanError> {
        let Some((generation, outbound)) = self.registry.current() else {
            return Err(ScanError::NoActiveConnection);
        };

        let message = Message::Text(command.to_json().into());
        match tokio::time::timeout(self.send_timeout, write(&outbound, message)).await {
            Ok(Ok(())) => {
                tracing::debug!(%generation, id = ?command.id, "command sent");
                Ok(())
            }
            Ok(Err(reason)) => Err(self.stale(generation, reason)),
            Err(_) => Err(self.stale(
                generation,
                format!("write timed out after {:?}", self.send_timeout),
            )),
        }
    }
}
