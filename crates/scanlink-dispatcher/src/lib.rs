//! Dispatcher side of scanlink.
//!
//! A [`Dispatcher`] listens for the device's WebSocket. The
//! [`ConnectionManager`] tracks the single active connection in a
//! [`ConnectionRegistry`], and the [`Correlator`] turns a scan request into a
//! command plus a bounded wait for the matching payload.

mod correlator;
mod error;
mod manager;
mod registry;
mod server;

pub use correlator::{CommandSink, Correlator, Mailbox, UnsolicitedPolicy};
pub use error::ScanError;
pub use manager::ConnectionManager;
pub use registry::{ConnectionRegistry, Generation};
pub use server::{Dispatcher, DispatcherConfig};

/// The correlator as wired up by [`Dispatcher`].
pub type ScanCorrelator = Correlator<ConnectionManager>;
