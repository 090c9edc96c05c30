//! Facade wiring the coordination core together for request handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::collector::{ResponseCollector, validate_payload};
use super::deadline::DeadlineEnforcer;
use super::drain::{LiveFeed, Subscription};
use super::gate::StreamGate;
use super::registry::CorrelationRegistry;
use crate::config::ExecConfig;
use crate::error::{ExecError, WorkerError};
use crate::worker::{CorrelationId, StreamEvent, WorkerLauncher, WorkerStatus, WorkerSupervisor};

/// Result of a fire-and-forget submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub correlation_id: CorrelationId,
    /// Execution deadline, when the timeout policy is active.
    pub deadline: Option<Instant>,
}

/// Single entry point over one worker session: submit, collect, subscribe,
/// restart. Cheap to share behind an `Arc`.
pub struct ExecCoordinator {
    config: ExecConfig,
    supervisor: Arc<WorkerSupervisor>,
    gate: StreamGate,
    registry: Arc<CorrelationRegistry>,
    enforcer: DeadlineEnforcer,
    collector: ResponseCollector,
    feed: LiveFeed,
}

impl ExecCoordinator {
    pub fn new(config: ExecConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let supervisor = Arc::new(WorkerSupervisor::new(launcher));
        let gate = StreamGate::new();
        let registry = Arc::new(CorrelationRegistry::new(config.exec_timeout));
        let enforcer = DeadlineEnforcer::new(
            Arc::clone(&registry),
            config.restart_on_timeout,
            config.enforcer_poll_interval,
        )
        .with_supervisor(Arc::clone(&supervisor));
        let feed = LiveFeed::new(
            Arc::clone(&supervisor),
            gate.clone(),
            Arc::clone(&registry),
            config.poll_interval,
            config.subscriber_capacity,
        );
        let collector = ResponseCollector::new(
            Arc::clone(&supervisor),
            gate.clone(),
            Arc::clone(&registry),
            enforcer.clone(),
            feed.clone(),
            config.poll_interval,
        );

        Self {
            config,
            supervisor,
            gate,
            registry,
            enforcer,
            collector,
            feed,
        }
    }

    /// Launch the worker session. Idempotent.
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.supervisor.init().await?;
        info!(
            timeout = ?self.config.exec_timeout,
            restart_on_timeout = self.config.restart_on_timeout,
            "Execution coordinator ready"
        );
        Ok(())
    }

    /// Close live subscriptions and shut the worker down.
    pub async fn shutdown(&self) {
        self.feed.stop();
        self.supervisor.teardown().await;
        let dropped = self.registry.clear().await;
        info!(dropped, "Execution coordinator stopped");
    }

    /// Enqueue `payload` without reading its output.
    ///
    /// With an active timeout policy the submission gets a deadline and an
    /// enforcer; its entry is resolved by the enforcer or by the live feed
    /// seeing it go idle.
    pub async fn submit(&self, payload: &str) -> Result<Submission, ExecError> {
        validate_payload(payload)?;
        let session = self.supervisor.session().await.ok_or(ExecError::NotReady)?;
        let correlation_id = session.submit(payload).await?;

        let deadline = self.registry.register(&correlation_id, Instant::now()).await;
        if deadline.is_some() {
            self.enforcer.spawn(session, correlation_id.clone());
        }
        info!(msg_id = %correlation_id, "Submitted");

        Ok(Submission {
            correlation_id,
            deadline,
        })
    }

    /// See [`ResponseCollector::execute_and_collect`].
    pub async fn submit_and_collect<T, F>(
        &self,
        payload: &str,
        predicate: F,
        register_timeout: bool,
        wait_timeout: Duration,
    ) -> Result<Option<T>, ExecError>
    where
        F: FnMut(&StreamEvent) -> anyhow::Result<Option<T>> + Send,
        T: Send,
    {
        self.collector
            .execute_and_collect(payload, predicate, register_timeout, wait_timeout)
            .await
    }

    /// Live view of every worker event from now on.
    pub async fn subscribe(&self) -> Subscription {
        self.feed.subscribe().await
    }

    /// Number of live subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    /// Replace the worker session. Every outstanding deadline is dropped, the
    /// work it tracked died with the old session.
    pub async fn restart_worker(&self) -> Result<(), WorkerError> {
        let result = self.supervisor.replace().await;
        let dropped = self.registry.clear().await;
        match result {
            Ok(()) => info!(dropped, "Worker restarted"),
            Err(ref e) => warn!(dropped, error = %e, "Worker restart failed, worker is down"),
        }
        result
    }

    pub async fn worker_status(&self) -> WorkerStatus {
        self.supervisor.status().await
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }
}
