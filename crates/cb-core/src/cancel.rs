//! Shared cancellation signal for cooperative polling loops.
//!
//! One token is created per experiment run and cloned into every component that
//! loops or blocks. The two flags are one-way: once set they stay set for the
//! lifetime of the run. `is_cancelled` is the condition every loop checks first;
//! `is_emergency` additionally marks safety-triggered stops so shutdown paths
//! can skip best-effort niceties.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Flags {
    cancelled: AtomicBool,
    emergency: AtomicBool,
}

/// Cloneable cancellation handle shared across the run.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flags: Arc<Flags>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an orderly stop. Loops exit within one polling interval.
    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::Relaxed);
    }

    /// Safety-triggered stop. Implies `cancel`.
    pub fn emergency_stop(&self) {
        self.flags.emergency.store(true, Ordering::Relaxed);
        self.flags.cancelled.store(true, Ordering::Relaxed);
    }

    /// True once either stop flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Relaxed) || self.flags.emergency.load(Ordering::Relaxed)
    }

    pub fn is_emergency(&self) -> bool {
        self.flags.emergency.load(Ordering::Relaxed)
    }
}
