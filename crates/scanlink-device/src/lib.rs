//! Device side of scanlink.
//!
//! The [`DeviceAgent`] keeps one outbound WebSocket to the dispatcher open,
//! reconnecting according to a [`RetryPolicy`](scanlink_core::RetryPolicy),
//! and answers scan commands by running a [`CaptureProvider`].

mod agent;
mod capture;
mod guard;

pub use agent::{AgentConfig, AgentError, DeviceAgent};
pub use capture::{CaptureError, CaptureProvider, CommandCapture, FileCapture};
pub use guard::{CaptureGuard, CaptureTicket};
