//! Cooperative stop signal.
//!
//! Checked between discrete units of work (one month, one gap, one poll
//! cycle) — never mid-unit, so a stop can never leave a partial partition
//! write behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable stop flag shared by all long-running loops.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. All loops exit at their next unit boundary.
    pub fn stop(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}
