//! Request/response correlation over the shared worker stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::deadline::DeadlineEnforcer;
use super::drain::LiveFeed;
use super::gate::StreamGate;
use super::registry::{CorrelationRegistry, PendingResolution};
use crate::error::ExecError;
use crate::worker::{CorrelationId, StreamEvent, WorkerSession, WorkerSupervisor};

/// Submits a payload and drains the gated stream until a caller predicate
/// matches one of the submission's events.
///
/// Every event pulled while the gate is held, matched or not, is handed to
/// the live feed, so subscribers and other submissions lose nothing.
pub struct ResponseCollector {
    supervisor: Arc<WorkerSupervisor>,
    gate: StreamGate,
    registry: Arc<CorrelationRegistry>,
    enforcer: DeadlineEnforcer,
    feed: LiveFeed,
    poll_interval: Duration,
}

impl ResponseCollector {
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        gate: StreamGate,
        registry: Arc<CorrelationRegistry>,
        enforcer: DeadlineEnforcer,
        feed: LiveFeed,
        poll_interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            gate,
            registry,
            enforcer,
            feed,
            poll_interval,
        }
    }

    /// Submit `payload` and return the first value `predicate` extracts from
    /// one of its events.
    ///
    /// Returns `Ok(None)` when the worker goes idle for this submission without
    /// a match, or when `wait_timeout` elapses first. The wait timeout is local:
    /// it never interrupts the worker. With `register_timeout` and an active
    /// execution-timeout policy, a deadline enforcer is spawned for the
    /// submission. The gate is released and the registry entry resolved on
    /// every exit path, including cancellation.
    pub async fn execute_and_collect<T, F>(
        &self,
        payload: &str,
        mut predicate: F,
        register_timeout: bool,
        wait_timeout: Duration,
    ) -> Result<Option<T>, ExecError>
    where
        F: FnMut(&StreamEvent) -> anyhow::Result<Option<T>> + Send,
        T: Send,
    {
        validate_payload(payload)?;
        let session = self.supervisor.session().await.ok_or(ExecError::NotReady)?;

        let gate = self.gate.acquire().await;
        let id = session.submit(payload).await?;
        let pending = PendingResolution::new(Arc::clone(&self.registry), id.clone());

        if register_timeout && self.registry.is_enabled() {
            self.registry.register(&id, Instant::now()).await;
            self.enforcer.spawn(Arc::clone(&session), id.clone());
        }

        let result = self
            .drain(session.as_ref(), &id, &mut predicate, wait_timeout)
            .await;

        gate.release();
        pending.resolve().await;
        Ok(result)
    }

    async fn drain<T, F>(
        &self,
        session: &dyn WorkerSession,
        id: &CorrelationId,
        predicate: &mut F,
        wait_timeout: Duration,
    ) -> Option<T>
    where
        F: FnMut(&StreamEvent) -> anyhow::Result<Option<T>>,
    {
        let deadline = Instant::now() + wait_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(msg_id = %id, ?wait_timeout, "Wait timeout elapsed without a match");
                return None;
            }
            let poll = remaining.min(self.poll_interval);

            let event = match session.poll_next_event(poll).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    // Transport hiccup: treat as "no match yet" and retry next tick.
                    debug!(msg_id = %id, error = %e, "Stream poll failed, retrying");
                    tokio::time::sleep(poll).await;
                    continue;
                }
            };

            self.feed.publish(&event).await;

            if !event.belongs_to(id) {
                trace!(
                    msg_id = %id,
                    other = ?event.parent_correlation_id,
                    kind = %event.kind,
                    "Passed on event for another submission"
                );
                continue;
            }

            match predicate(&event) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => {
                    debug!(msg_id = %id, kind = %event.kind, error = %e, "Matcher failed on event, skipping it");
                }
            }

            if event.is_idle() {
                debug!(msg_id = %id, "Worker idle without a match");
                return None;
            }
        }
    }
}

pub(crate) fn validate_payload(payload: &str) -> Result<(), ExecError> {
    if payload.trim().is_empty() {
        return Err(ExecError::InvalidSubmission("no code".to_string()));
    }
    Ok(())
}
