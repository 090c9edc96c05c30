//! Per-submission execution deadline enforcement.
//!
//! The stream has no out-of-band cancel, so the only way to bound a runaway
//! unit is to interrupt the worker itself, and restart it when configured.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::{CorrelationRegistry, PendingResolution};
use crate::worker::{CorrelationId, WorkerSession, WorkerSupervisor};

/// What an enforcer ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementOutcome {
    /// No positive timeout configured; returned without polling.
    Disabled,
    /// Someone resolved the submission before its deadline.
    Resolved,
    /// Deadline passed; worker interrupted, no restart policy.
    Interrupted,
    /// Deadline passed; worker interrupted and restarted (possibly via shutdown + start).
    Restarted,
    /// Deadline passed; restart and the shutdown + start fallback both failed.
    RestartFailed,
}

/// Watches one submission's deadline and acts on the worker when it passes.
#[derive(Clone)]
pub struct DeadlineEnforcer {
    registry: Arc<CorrelationRegistry>,
    supervisor: Option<Arc<WorkerSupervisor>>,
    restart_on_timeout: bool,
    poll_interval: Duration,
}

impl DeadlineEnforcer {
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        restart_on_timeout: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor: None,
            restart_on_timeout,
            poll_interval,
        }
    }

    /// Report timeout restarts to `supervisor` so its status reflects them.
    pub fn with_supervisor(mut self, supervisor: Arc<WorkerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Run `enforce` as an independent task. Callers normally don't await it.
    pub fn spawn(
        &self,
        session: Arc<dyn WorkerSession>,
        id: CorrelationId,
    ) -> JoinHandle<EnforcementOutcome> {
        let enforcer = self.clone();
        tokio::spawn(async move { enforcer.enforce(session.as_ref(), &id).await })
    }

    /// Wait for `id` to be resolved or its deadline to pass. Lifecycle failures
    /// are logged, never returned. The entry is resolved on every exit path.
    pub async fn enforce(
        &self,
        session: &dyn WorkerSession,
        id: &CorrelationId,
    ) -> EnforcementOutcome {
        if !self.registry.is_enabled() {
            return EnforcementOutcome::Disabled;
        }

        let pending = PendingResolution::new(Arc::clone(&self.registry), id.clone());
        let outcome = match self.wait_for_deadline(id).await {
            Some(deadline) => self.act_on_expiry(session, id, deadline).await,
            None => EnforcementOutcome::Resolved,
        };
        pending.resolve().await;
        outcome
    }

    /// `Some(deadline)` once it has passed, `None` if the entry disappeared first.
    async fn wait_for_deadline(&self, id: &CorrelationId) -> Option<Instant> {
        loop {
            let Some(deadline) = self.registry.deadline_for(id).await else {
                debug!(msg_id = %id, "Submission resolved before its deadline");
                return None;
            };
            let now = Instant::now();
            if now >= deadline {
                return Some(deadline);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn act_on_expiry(
        &self,
        session: &dyn WorkerSession,
        id: &CorrelationId,
        deadline: Instant,
    ) -> EnforcementOutcome {
        warn!(
            msg_id = %id,
            timeout = ?self.registry.timeout(),
            overdue = ?deadline.elapsed(),
            "Execution deadline passed, interrupting worker"
        );

        if let Err(e) = session.interrupt().await {
            warn!(msg_id = %id, error = %e, "Interrupt failed, continuing");
        }

        if !self.restart_on_timeout {
            return EnforcementOutcome::Interrupted;
        }

        let outcome = match session.restart().await {
            Ok(()) => EnforcementOutcome::Restarted,
            Err(e) => {
                warn!(msg_id = %id, error = %e, "Restart failed, falling back to shutdown + start");
                if let Err(e) = session.shutdown().await {
                    warn!(msg_id = %id, error = %e, "Shutdown during restart fallback failed");
                }
                match session.start().await {
                    Ok(()) => EnforcementOutcome::Restarted,
                    Err(e) => {
                        error!(msg_id = %id, error = %e, "Worker could not be restarted after timeout");
                        EnforcementOutcome::RestartFailed
                    }
                }
            }
        };

        if outcome == EnforcementOutcome::Restarted {
            if let Some(ref supervisor) = self.supervisor {
                supervisor.record_restart().await;
            }
            let dropped = self.registry.clear().await;
            info!(msg_id = %id, dropped, "Worker restarted after timeout");
        }
        outcome
    }
}
