//! In-memory worker whose stream is fed by hand.
//!
//! Used by the crate's own tests and handy for downstream tests of request
//! handlers: push events with [`ScriptedWorker::push`] or install a responder
//! that reacts to each submission, then inspect the lifecycle counters.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::event::{CorrelationId, StreamEvent};
use super::session::{WorkerLauncher, WorkerSession};
use crate::error::WorkerError;

/// Produces the events a submission should emit, in order.
pub type Responder = Box<dyn Fn(&CorrelationId, &str) -> Vec<StreamEvent> + Send + Sync>;

pub struct ScriptedWorker {
    next_id: AtomicU64,
    events_tx: StdMutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    events_rx: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    submitted: StdMutex<Vec<(CorrelationId, String)>>,
    responder: Option<Responder>,
    failing_polls: AtomicUsize,
    fail_interrupt: AtomicBool,
    fail_restart: AtomicBool,
    fail_shutdown: AtomicBool,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
    shutdowns: AtomicUsize,
    starts: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(1),
            events_tx: StdMutex::new(Some(events_tx)),
            events_rx: Mutex::new(events_rx),
            submitted: StdMutex::new(Vec::new()),
            responder: None,
            failing_polls: AtomicUsize::new(0),
            fail_interrupt: AtomicBool::new(false),
            fail_restart: AtomicBool::new(false),
            fail_shutdown: AtomicBool::new(false),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }

    /// Emit `responder(id, payload)` onto the stream for every submission.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&CorrelationId, &str) -> Vec<StreamEvent> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Responder that echoes the payload on stdout and then goes idle.
    pub fn echo() -> Self {
        Self::new().with_responder(|id, payload| {
            vec![
                StreamEvent::busy(id),
                StreamEvent::stream(id, "stdout", payload),
                StreamEvent::idle(id),
            ]
        })
    }

    /// Append an event to the stream. Ignored once the stream is closed.
    pub fn push(&self, event: StreamEvent) {
        if let Some(ref tx) = *self.events_tx.lock().unwrap_or_else(|e| e.into_inner()) {
            let _ = tx.send(event);
        }
    }

    /// Close the stream: buffered events are still delivered, then polls fail
    /// with `WorkerError::StreamClosed`.
    pub fn close_stream(&self) {
        self.events_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn push_all(&self, events: impl IntoIterator<Item = StreamEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Make the next `n` polls fail with a transient error.
    pub fn fail_next_polls(&self, n: usize) {
        self.failing_polls.store(n, Ordering::SeqCst);
    }

    pub fn fail_interrupts(&self, fail: bool) {
        self.fail_interrupt.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    pub fn fail_shutdowns(&self, fail: bool) {
        self.fail_shutdown.store(fail, Ordering::SeqCst);
    }

    /// Every accepted submission, in order.
    pub fn submitted(&self) -> Vec<(CorrelationId, String)> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerSession for ScriptedWorker {
    async fn submit(&self, payload: &str) -> Result<CorrelationId, WorkerError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = CorrelationId::new(format!("msg-{n}"));
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), payload.to_string()));

        if let Some(ref responder) = self.responder {
            self.push_all(responder(&id, payload));
        }
        Ok(id)
    }

    async fn poll_next_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<StreamEvent>, WorkerError> {
        let should_fail = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(WorkerError::Poll {
                reason: "scripted poll failure".to_string(),
            });
        }

        let next = tokio::time::timeout(timeout, async {
            self.events_rx.lock().await.recv().await
        })
        .await;

        match next {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(WorkerError::StreamClosed),
            Err(_) => Ok(None),
        }
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.fail_interrupt.load(Ordering::SeqCst) {
            return Err(WorkerError::lifecycle("interrupt", "scripted failure"));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), WorkerError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(WorkerError::lifecycle("restart", "scripted failure"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(WorkerError::lifecycle("shutdown", "scripted failure"));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), WorkerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher handing out scripted workers.
///
/// Built with [`ScriptedLauncher::new`] every launch creates a fresh echo
/// worker; built with [`ScriptedLauncher::with_worker`] every launch returns
/// the same instance.
pub struct ScriptedLauncher {
    shared: Option<Arc<ScriptedWorker>>,
    launched: StdMutex<Vec<Arc<ScriptedWorker>>>,
    fail_next: AtomicBool,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            shared: None,
            launched: StdMutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn with_worker(worker: Arc<ScriptedWorker>) -> Self {
        Self {
            shared: Some(worker),
            ..Self::new()
        }
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The most recently launched worker.
    pub fn latest(&self) -> Option<Arc<ScriptedWorker>> {
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Arc<dyn WorkerSession>, WorkerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(WorkerError::LaunchFailed {
                reason: "scripted launch failure".to_string(),
            });
        }
        let worker = match self.shared {
            Some(ref worker) => Arc::clone(worker),
            None => Arc::new(ScriptedWorker::echo()),
        };
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&worker));
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn ids_are_sequential() {
        let worker = ScriptedWorker::new();
        assert_eq!(worker.submit("a").await.unwrap().as_str(), "msg-1");
        assert_eq!(worker.submit("b").await.unwrap().as_str(), "msg-2");
    }

    #[tokio::test]
    async fn echo_responder_emits_output_then_idle() {
        let worker = ScriptedWorker::echo();
        let id = worker.submit("hello").await.unwrap();

        let busy = worker.poll_next_event(POLL).await.unwrap().unwrap();
        assert_eq!(busy.execution_state(), Some("busy"));
        let out = worker.poll_next_event(POLL).await.unwrap().unwrap();
        assert_eq!(out.stream_text("stdout"), Some("hello"));
        let idle = worker.poll_next_event(POLL).await.unwrap().unwrap();
        assert!(idle.is_idle() && idle.belongs_to(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_times_out_with_none() {
        let worker = ScriptedWorker::new();
        assert!(worker.poll_next_event(POLL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scripted_poll_failures_are_transient() {
        let worker = ScriptedWorker::new();
        worker.fail_next_polls(2);
        for _ in 0..2 {
            let err = worker.poll_next_event(POLL).await.unwrap_err();
            assert!(err.is_transient());
        }
        worker.push(StreamEvent::status(None, "starting"));
        assert!(worker.poll_next_event(POLL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_stream_drains_then_fails() {
        let worker = ScriptedWorker::new();
        worker.push(StreamEvent::status(None, "starting"));
        worker.close_stream();

        assert!(worker.poll_next_event(POLL).await.unwrap().is_some());
        let err = worker.poll_next_event(POLL).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn lifecycle_calls_are_counted_even_when_failing() {
        let worker = ScriptedWorker::new();
        worker.fail_restarts(true);
        assert!(worker.interrupt().await.is_ok());
        assert!(worker.restart().await.is_err());
        assert_eq!(worker.interrupt_count(), 1);
        assert_eq!(worker.restart_count(), 1);
    }
}
