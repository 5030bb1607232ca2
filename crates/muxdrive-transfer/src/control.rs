//! Per-transfer pause/cancel control
//!
//! Workers consult the control between blocks, so a pause or cancel takes
//! effect within one block's worth of time and never tears a block.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// What the worker should do at the next block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlGate {
    Proceed,
    Paused,
    Cancelled,
}

/// Shared pause/cancel flags for one running transfer.
#[derive(Debug, Default)]
pub struct TransferControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Snapshot of the control state at a block boundary.
    pub fn gate(&self) -> ControlGate {
        if self.is_cancelled() {
            ControlGate::Cancelled
        } else if self.is_paused() {
            ControlGate::Paused
        } else {
            ControlGate::Proceed
        }
    }
}
