//! Registry of in-flight submissions and their execution deadlines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::worker::CorrelationId;

/// Maps each outstanding submission to its absolute deadline.
///
/// An entry exists only while a timeout policy is active and nobody has yet
/// observed the submission finish. Every operation takes the single internal
/// lock and never waits on I/O.
pub struct CorrelationRegistry {
    timeout: Duration,
    deadlines: Mutex<HashMap<CorrelationId, Instant>>,
}

impl CorrelationRegistry {
    /// `timeout` of zero disables registration entirely.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Record `now + timeout` as the deadline for `id`, overwriting any earlier
    /// entry. No-op (returns `None`) when the policy is disabled.
    pub async fn register(&self, id: &CorrelationId, now: Instant) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        let deadline = now + self.timeout;
        self.deadlines.lock().await.insert(id.clone(), deadline);
        debug!(msg_id = %id, timeout = ?self.timeout, "Registered execution deadline");
        Some(deadline)
    }

    /// Forget `id`. Absent ids are fine: already resolved or never registered.
    pub async fn resolve(&self, id: &CorrelationId) {
        if self.deadlines.lock().await.remove(id).is_some() {
            debug!(msg_id = %id, "Resolved execution deadline");
        }
    }

    pub async fn deadline_for(&self, id: &CorrelationId) -> Option<Instant> {
        self.deadlines.lock().await.get(id).copied()
    }

    /// Drop every entry. Used when the worker restarts and all in-flight work is gone.
    pub async fn clear(&self) -> usize {
        let mut deadlines = self.deadlines.lock().await;
        let count = deadlines.len();
        deadlines.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.deadlines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deadlines.lock().await.is_empty()
    }
}

/// Resolves a registry entry exactly once: explicitly through `resolve()`, or
/// from a spawned task when dropped first (e.g. the owning future was cancelled).
pub(crate) struct PendingResolution {
    registry: Arc<CorrelationRegistry>,
    id: Option<CorrelationId>,
}

impl PendingResolution {
    pub(crate) fn new(registry: Arc<CorrelationRegistry>, id: CorrelationId) -> Self {
        Self {
            registry,
            id: Some(id),
        }
    }

    pub(crate) async fn resolve(mut self) {
        if let Some(id) = self.id.take() {
            self.registry.resolve(&id).await;
        }
    }
}

impl Drop for PendingResolution {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            handle.spawn(async move {
                registry.resolve(&id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CorrelationId {
        CorrelationId::from(s)
    }

    #[tokio::test]
    async fn register_sets_now_plus_timeout() {
        let registry = CorrelationRegistry::new(Duration::from_secs(10));
        let now = Instant::now();

        let deadline = registry.register(&id("a"), now).await;
        assert_eq!(deadline, Some(now + Duration::from_secs(10)));
        assert_eq!(registry.deadline_for(&id("a")).await, deadline);
    }

    #[tokio::test]
    async fn disabled_policy_never_registers() {
        let registry = CorrelationRegistry::new(Duration::ZERO);
        assert!(!registry.is_enabled());

        assert_eq!(registry.register(&id("a"), Instant::now()).await, None);
        assert_eq!(registry.deadline_for(&id("a")).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn register_overwrites() {
        let registry = CorrelationRegistry::new(Duration::from_secs(1));
        let t0 = Instant::now();
        registry.register(&id("a"), t0).await;
        registry.register(&id("a"), t0 + Duration::from_secs(5)).await;

        assert_eq!(
            registry.deadline_for(&id("a")).await,
            Some(t0 + Duration::from_secs(6))
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let registry = CorrelationRegistry::new(Duration::from_secs(1));
        registry.register(&id("a"), Instant::now()).await;

        registry.resolve(&id("a")).await;
        registry.resolve(&id("a")).await;
        registry.resolve(&id("never-registered")).await;

        assert_eq!(registry.deadline_for(&id("a")).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let registry = CorrelationRegistry::new(Duration::from_secs(1));
        let now = Instant::now();
        registry.register(&id("a"), now).await;
        registry.register(&id("b"), now).await;

        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn pending_resolution_resolves_explicitly() {
        let registry = Arc::new(CorrelationRegistry::new(Duration::from_secs(1)));
        registry.register(&id("a"), Instant::now()).await;

        PendingResolution::new(Arc::clone(&registry), id("a"))
            .resolve()
            .await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn pending_resolution_resolves_on_drop() {
        let registry = Arc::new(CorrelationRegistry::new(Duration::from_secs(1)));
        registry.register(&id("a"), Instant::now()).await;

        drop(PendingResolution::new(Arc::clone(&registry), id("a")));
        for _ in 0..10 {
            if registry.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.is_empty().await);
    }
}
