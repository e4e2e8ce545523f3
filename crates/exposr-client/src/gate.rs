//! Connect gate: serializes transport connection attempts across slots
//!
//! Waiters are served in arrival order and the lock is handed directly to
//! the head waiter on release. A waiter whose cancellation token fires
//! leaves the queue without disturbing the order of the others.

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;

#[derive(Debug, Default)]
pub struct ConnectGate {
    // tokio's Mutex is fair: lock() calls complete in the order they were made
    lock: Mutex<()>,
}

/// Held while connecting. Dropping it releases the gate.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ConnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the gate. Fails with [`Cancelled`] if `cancel` fires first,
    /// including when it has already fired.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GateGuard<'_>, Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            guard = self.lock.lock() => Ok(GateGuard { _guard: guard }),
        }
    }

    /// Take the gate if it is free.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.lock.try_lock().ok().map(|guard| GateGuard { _guard: guard })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl GateGuard<'_> {
    /// Release the gate, handing it to the next waiter.
    pub fn release(self) {}
}
