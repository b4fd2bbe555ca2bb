//! WebSocket accept loop.

use crate::correlator::{Correlator, Mailbox, UnsolicitedPolicy};
use crate::manager::ConnectionManager;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen: SocketAddr,
    /// How long a command write may take before the connection is dropped.
    pub send_timeout: Duration,
    pub unsolicited: UnsolicitedPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8765).into(),
            send_timeout: Duration::from_secs(5),
            unsolicited: UnsolicitedPolicy::default(),
        }
    }
}

/// Bound listener plus the manager and correlator serving it.
pub struct Dispatcher {
    listener: TcpListener,
    manager: ConnectionManager,
    correlator: Arc<Correlator<ConnectionManager>>,
}

impl Dispatcher {
    pub async fn bind(config: DispatcherConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let mailbox = Mailbox::new(config.unsolicited);
        let manager = ConnectionManager::new(mailbox.clone(), config.send_timeout);
        let correlator = Arc::new(Correlator::new(manager.clone(), mailbox));
        Ok(Self {
            listener,
            manager,
            correlator,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn correlator(&self) -> Arc<Correlator<ConnectionManager>> {
        Arc::clone(&self.correlator)
    }

    /// Accept device connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Listening on ws://{}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.handle_connection(stream, peer).await {
                    tracing::warn!("Connection error from {}: {}", peer, e);
                }
            });
        }

        tracing::info!("dispatcher stopped");
        Ok(())
    }
}
