//! The single active device connection.
//!
//! Every accepted connection gets a fresh [`Generation`]. Registering always
//! replaces whatever was active; releasing only clears the slot when the
//! generation still matches, so a late close from a superseded connection
//! cannot evict its replacement.

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{self, Message};

/// Identity token of one accepted connection. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// A frame queued for a connection task, with a slot for the write result.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub message: Message,
    pub ack: oneshot::Sender<Result<(), tungstenite::Error>>,
}

#[derive(Debug)]
struct Active {
    generation: Generation,
    peer: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
}

/// Holds at most one active connection.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next: AtomicU64,
    active: Mutex<Option<Active>>,
    peer: watch::Sender<Option<SocketAddr>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (peer, _) = watch::channel(None);
        Self {
            next: AtomicU64::new(1),
            active: Mutex::new(None),
            peer,
        }
    }

    /// Make a connection the active one, superseding any previous connection.
    /// Dropping the previous sender ends that connection's task.
    pub(crate) fn register(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
    ) -> Generation {
        let generation = Generation(self.next.fetch_add(1, Ordering::Relaxed));
        let mut active = self.active.lock();
        let previous = active.replace(Active {
            generation,
            peer,
            outbound,
        });
        // Published under the lock so a concurrent release cannot reorder it.
        self.peer.send_replace(Some(peer));
        drop(active);

        if let Some(previous) = previous {
            tracing::info!(
                old = %previous.generation,
                old_peer = %previous.peer,
                new = %generation,
                new_peer = %peer,
                "device connection superseded"
            );
        }
        generation
    }

    /// Clear the slot if `generation` is still the active one.
    pub fn release(&self, generation: Generation) -> bool {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(current) if current.generation == generation => {
                *active = None;
                self.peer.send_replace(None);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn current(&self) -> Option<(Generation, mpsc::Sender<Outbound>)> {
        self.active
            .lock()
            .as_ref()
            .map(|a| (a.generation, a.outbound.clone()))
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.active.lock().as_ref().map(|a| a.generation)
    }

    /// Address of the connected device, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|a| a.peer)
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Watch the connected peer change. `None` means no device.
    pub fn watch(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.peer.subscribe()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn channel() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(1)
    }

    #[test]
    fn generations_increase() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let ga = registry.register(addr(1), a);
        let gb = registry.register(addr(2), b);
        assert!(gb > ga);
    }

    #[test]
    fn newer_connection_wins() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = channel();
        let (b, _rb) = channel();
        registry.register(addr(1), a);
        let gb = registry.register(addr(2), b);

        assert_eq!(registry.active_generation(), Some(gb));
        assert_eq!(registry.peer(), Some(addr(2)));
        // The superseded connection's queue is closed.
        assert!(matches!(
            ra.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn stale_close_after_replacement_keeps_newer() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let ga = registry.register(addr(1), a);
        let gb = registry.register(addr(2), b);

        assert!(!registry.release(ga));
        assert_eq!(registry.active_generation(), Some(gb));
    }

    #[test]
    fn close_before_replacement_keeps_newer() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let ga = registry.register(addr(1), a);
        assert!(registry.release(ga));
        let gb = registry.register(addr(2), b);

        assert_eq!(registry.active_generation(), Some(gb));
    }

    #[test]
    fn release_current_clears() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel();
        let ga = registry.register(addr(1), a);
        assert!(registry.release(ga));
        assert!(!registry.is_connected());
        assert!(registry.current().is_none());
        assert!(!registry.release(ga));
    }

    #[test]
    fn watch_follows_peer() {
        let registry = ConnectionRegistry::new();
        let rx = registry.watch();
        assert_eq!(*rx.borrow(), None);

        let (a, _ra) = channel();
        let ga = registry.register(addr(9), a);
        assert_eq!(*rx.borrow(), Some(addr(9)));

        registry.release(ga);
        assert_eq!(*rx.borrow(), None);
    }

    #[test]
    fn watch_agrees_with_slot_under_contention() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let rx = registry.watch();

        for round in 0..200u16 {
            let (a, _ra) = channel();
            let ga = registry.register(addr(1), a);

            let releaser = {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || registry.release(ga))
            };
            let (b, _rb) = channel();
            registry.register(addr(1000 + round), b);
            releaser.join().unwrap();

            assert_eq!(*rx.borrow(), registry.peer(), "round {round}");
            assert!(registry.is_connected());
        }
    }
}
