//! Mutual-exclusion gate over the shared worker stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// At most one logical reader pulls from the worker stream at a time.
///
/// Cooperative, not preemptive: a holder that never drops its [`GateGuard`]
/// stalls every other reader. No fairness among waiters.
#[derive(Clone, Default)]
pub struct StreamGate {
    lock: Arc<Mutex<()>>,
    held: Arc<AtomicBool>,
}

impl StreamGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the gate is free, then hold it until the guard is dropped.
    pub async fn acquire(&self) -> GateGuard {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        self.held.store(true, Ordering::SeqCst);
        GateGuard {
            _guard: guard,
            held: Arc::clone(&self.held),
        }
    }

    /// Take the gate only if nobody holds it right now.
    pub fn try_acquire(&self) -> Option<GateGuard> {
        let guard = Arc::clone(&self.lock).try_lock_owned().ok()?;
        self.held.store(true, Ordering::SeqCst);
        Some(GateGuard {
            _guard: guard,
            held: Arc::clone(&self.held),
        })
    }

    /// Non-blocking, best-effort check. A holder may appear or vanish right
    /// after this returns.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Exclusive hold on the stream. Dropping it releases the gate on every exit path.
pub struct GateGuard {
    _guard: OwnedMutexGuard<()>,
    held: Arc<AtomicBool>,
}

impl GateGuard {
    /// Release explicitly; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
