//! Worker session and launcher traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::event::{CorrelationId, StreamEvent};
use crate::error::WorkerError;

/// A live connection to the single long-lived worker process.
///
/// The worker executes submissions strictly in FIFO order and writes every
/// resulting event to one shared, ordered stream. Lifecycle calls are
/// best-effort: callers treat their errors as recoverable.
#[async_trait]
pub trait WorkerSession: Send + Sync {
    /// Enqueue a unit of work and return its correlation id immediately.
    async fn submit(&self, payload: &str) -> Result<CorrelationId, WorkerError>;

    /// Pull the next stream event, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time. Must never block indefinitely.
    async fn poll_next_event(&self, timeout: Duration)
    -> Result<Option<StreamEvent>, WorkerError>;

    /// Ask the worker to abort the unit it is currently running.
    async fn interrupt(&self) -> Result<(), WorkerError>;

    /// Restart the worker in place, dropping queued work.
    async fn restart(&self) -> Result<(), WorkerError>;

    async fn shutdown(&self) -> Result<(), WorkerError>;

    async fn start(&self) -> Result<(), WorkerError>;
}

/// Creates fresh worker sessions for the supervisor.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn WorkerSession>, WorkerError>;
}
