//! Single-capture reentrancy guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Allows at most one capture at a time. Shared between sessions, so a
/// capture outliving its connection still blocks the next one.
#[derive(Debug, Clone, Default)]
pub struct CaptureGuard {
    busy: Arc<AtomicBool>,
}

impl CaptureGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a capture is already running.
    pub fn try_begin(&self) -> Option<CaptureTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CaptureTicket {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one capture; releases the guard on drop.
#[derive(Debug)]
pub struct CaptureTicket {
    busy: Arc<AtomicBool>,
}

impl Drop for CaptureTicket {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
