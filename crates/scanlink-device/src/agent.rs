//! Device agent: connection lifecycle and command handling.

use crate::capture::{CaptureError, CaptureProvider};
use crate::guard::{CaptureGuard, CaptureTicket};
use futures_util::{SinkExt, StreamExt};
use scanlink_core::{Command, ConnectionState, DeviceReport, Payload, RequestId, RetryPolicy};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Dispatcher endpoint, e.g. `ws://10.0.0.2:8765`.
    pub url: String,
    pub connect_timeout: Duration,
    /// Upper bound on a single capture; exceeding it is reported as a failure.
    pub capture_timeout: Duration,
    pub retry: RetryPolicy,
}

impl AgentConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Why a session ended, or why the agent stopped.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("connection error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Result of one capture, waiting to be written back to the dispatcher.
struct CaptureOutcome {
    id: Option<RequestId>,
    result: Result<Vec<u8>, CaptureError>,
    ticket: CaptureTicket,
}

impl CaptureOutcome {
    fn into_parts(self) -> (Message, CaptureTicket) {
        let message = match self.result {
            Ok(data) => {
                tracing::info!(id = ?self.id, bytes = data.len(), "capture complete");
                let payload = match self.id {
                    Some(id) => Payload::tagged(id, data),
                    None => Payload::untagged(data),
                };
                Message::Binary(payload.encode().into())
            }
            Err(e) => {
                tracing::warn!(id = ?self.id, error = %e, "capture failed");
                let report = DeviceReport::error(self.id, e.to_string());
                Message::Text(report.to_json().into())
            }
        };
        (message, self.ticket)
    }
}

/// Keeps the device connected to its dispatcher and serves scan commands.
pub struct DeviceAgent<C> {
    config: AgentConfig,
    capture: Arc<C>,
    guard: CaptureGuard,
    state: ConnectionState,
    events: broadcast::Sender<ConnectionState>,
}

impl<C: CaptureProvider> DeviceAgent<C> {
    pub fn new(config: AgentConfig, capture: C) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            capture: Arc::new(capture),
            guard: CaptureGuard::new(),
            state: ConnectionState::Disconnected,
            events,
        }
    }

    /// Receive every connectivity transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connect, serve, reconnect, until `shutdown` resolves.
    ///
    /// Returns an error only when the retry policy runs out of attempts.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut attempt = 0u32;

        loop {
            let end = self.session(shutdown.as_mut(), &mut attempt).await;
            self.set_state(ConnectionState::Disconnected);

            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    tracing::info!(url = %self.config.url, "connection closed");
                }
                Err(e) => tracing::warn!(error = %e, "connection lost"),
            }

            let Some(delay) = self.config.retry.delay_for(attempt) else {
                tracing::error!(attempts = attempt, "reconnect attempts exhausted");
                return Err(AgentError::RetriesExhausted(attempt));
            };
            attempt = attempt.saturating_add(1);
            tracing::debug!(?delay, attempt, "scheduling reconnect");

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("device agent stopped");
        Ok(())
    }

    async fn session<F>(
        &mut self,
        mut shutdown: Pin<&mut F>,
        attempt: &mut u32,
    ) -> Result<SessionEnd, AgentError>
    where
        F: Future<Output = ()>,
    {
        self.set_state(ConnectionState::Connecting);

        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout;
        let connected = tokio::select! {
            _ = &mut shutdown => return Ok(SessionEnd::Shutdown),
            result = tokio::time::timeout(timeout, connect_async(url.as_str())) => result,
        };
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(source)) => return Err(AgentError::Connect { url, source }),
            Err(_) => return Err(AgentError::ConnectTimeout { url, timeout }),
        };

        *attempt = 0;
        self.set_state(ConnectionState::Connected);
        tracing::info!(%url, "connected to dispatcher");

        let (mut sink, mut stream) = ws.split();
        let (done_tx, mut done_rx) = mpsc::channel::<CaptureOutcome>(1);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "close frame not sent");
                    }
                    return Ok(SessionEnd::Shutdown);
                }

                Some(outcome) = done_rx.recv() => {
                    let (message, ticket) = outcome.into_parts();
                    sink.send(message).await?;
                    // Released only once the result is on the wire.
                    drop(ticket);
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str(), &done_tx),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "dispatcher closed the connection");
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::Closed),
                },
            }
        }
    }

    fn on_text(&self, text: &str, done: &mpsc::Sender<CaptureOutcome>) {
        let Some(command) = Command::parse(text) else {
            tracing::debug!(%text, "ignoring unrecognized message");
            return;
        };
        let Some(ticket) = self.guard.try_begin() else {
            tracing::debug!(id = ?command.id, "capture in progress, dropping command");
            return;
        };

        tracing::info!(id = ?command.id, "capture requested");
        let capture = Arc::clone(&self.capture);
        let timeout = self.config.capture_timeout;
        let done = done.clone();
        tokio::spawn(async move {
            let result = capture_bounded(capture.as_ref(), timeout).await;
            let outcome = CaptureOutcome {
                id: command.id,
                result,
                ticket,
            };
            if done.send(outcome).await.is_err() {
                tracing::debug!(id = ?command.id, "connection gone, discarding capture result");
            }
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            tracing::debug!(%state, "connection state changed");
            let _ = self.events.send(state);
        }
    }
}

async fn capture_bounded<C: CaptureProvider>(
    provider: &C,
    timeout: Duration,
) -> Result<Vec<u8>, CaptureError> {
    match tokio::time::timeout(timeout, provider.capture()).await {
        Ok(Ok(data)) if data.is_empty() => Err(CaptureError::Empty),
        Ok(result) => result,
        Err(_) => Err(CaptureError::TimedOut(timeout)),
    }
}
