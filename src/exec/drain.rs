//! Live drain loop and subscriber fan-out.
//!
//! One drain task per feed pulls events whenever the gate is free and
//! broadcasts them to every subscriber, so concurrent subscribers each see the
//! full narrative instead of splitting it. While a collector holds the gate it
//! republishes what it pulls through [`LiveFeed::publish`]. The task starts
//! with the first subscriber and retires when the last one leaves.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::gate::StreamGate;
use super::registry::CorrelationRegistry;
use crate::worker::{Envelope, StreamEvent, WorkerSupervisor};

/// Wait between checks while no worker session exists.
const NO_WORKER_BACKOFF: Duration = Duration::from_millis(100);

/// Wait before re-probing the gate, or after an empty or failed poll.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Why a drain task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    /// The last subscriber went away.
    NoSubscribers,
    /// The worker stream failed unrecoverably; subscriptions were closed.
    StreamClosed,
}

struct Running {
    tx: broadcast::Sender<Envelope>,
    handle: JoinHandle<DrainExit>,
}

struct FeedInner {
    supervisor: Arc<WorkerSupervisor>,
    gate: StreamGate,
    registry: Arc<CorrelationRegistry>,
    poll_interval: Duration,
    capacity: usize,
    running: StdMutex<Option<Running>>,
}

/// Best-effort forwarder of the worker stream to live subscribers.
///
/// Never queues for the gate: while a collector holds it the drain backs off
/// and the collector publishes every event it pulls instead.
#[derive(Clone)]
pub struct LiveFeed {
    inner: Arc<FeedInner>,
}

impl LiveFeed {
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        gate: StreamGate,
        registry: Arc<CorrelationRegistry>,
        poll_interval: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                supervisor,
                gate,
                registry,
                poll_interval,
                capacity,
                running: StdMutex::new(None),
            }),
        }
    }

    /// Start receiving envelopes from now on. No replay of earlier events.
    ///
    /// The first subscriber discards whatever piled up on the stream while
    /// nobody was draining it.
    pub async fn subscribe(&self) -> Subscription {
        if let Some(subscription) = self.join_running() {
            return subscription;
        }
        self.inner.discard_backlog().await;

        let mut running = lock(&self.inner.running);
        if let Some(ref current) = *running
            && !current.handle.is_finished()
        {
            return Subscription {
                rx: current.tx.subscribe(),
            };
        }

        let (tx, rx) = broadcast::channel(self.inner.capacity);
        let handle = tokio::spawn(Arc::clone(&self.inner).run(tx.clone()));
        *running = Some(Running { tx, handle });
        debug!("Live drain spawned for first subscriber");
        Subscription { rx }
    }

    fn join_running(&self) -> Option<Subscription> {
        lock(&self.inner.running)
            .as_ref()
            .filter(|r| !r.handle.is_finished())
            .map(|r| Subscription {
                rx: r.tx.subscribe(),
            })
    }

    /// Forward an event pulled by another reader, normally a collector holding
    /// the gate. Idle events resolve their registry entry even when nobody is
    /// subscribed.
    pub async fn publish(&self, event: &StreamEvent) {
        self.inner.resolve_if_idle(event).await;
        if let Some(ref running) = *lock(&self.inner.running) {
            // No receivers just means nobody is watching right now.
            let _ = running.tx.send(event.envelope());
        }
    }

    /// Whether a drain task is currently forwarding.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.running)
            .as_ref()
            .map_or(0, |r| r.tx.receiver_count())
    }

    /// Stop forwarding and close every subscription.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.inner.running).take() {
            running.handle.abort();
        }
    }
}

impl FeedInner {
    async fn run(self: Arc<Self>, tx: broadcast::Sender<Envelope>) -> DrainExit {
        info!("Live drain started");
        let exit = loop {
            if self.retire_if_unobserved(&tx) {
                break DrainExit::NoSubscribers;
            }

            let Some(session) = self.supervisor.session().await else {
                tokio::time::sleep(NO_WORKER_BACKOFF).await;
                continue;
            };

            if self.gate.is_held() {
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }

            match session.poll_next_event(self.poll_interval).await {
                Ok(Some(event)) => {
                    self.resolve_if_idle(&event).await;
                    // Fails only when every subscriber left; the next pass retires.
                    let _ = tx.send(event.envelope());
                }
                Ok(None) => tokio::time::sleep(RETRY_BACKOFF).await,
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Live drain poll failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, "Worker stream unusable, closing live subscriptions");
                    lock(&self.running).take();
                    break DrainExit::StreamClosed;
                }
            }
        };
        info!(?exit, "Live drain stopped");
        exit
    }

    /// Second cleanup path for submissions nobody is collecting.
    async fn resolve_if_idle(&self, event: &StreamEvent) {
        if event.is_idle()
            && let Some(ref id) = event.parent_correlation_id
        {
            self.registry.resolve(id).await;
        }
    }

    /// Drop events queued while nothing drained the stream. Skipped when a
    /// collector holds the gate; it is reading the stream already.
    async fn discard_backlog(&self) {
        let Some(session) = self.supervisor.session().await else {
            return;
        };
        let Some(_gate) = self.gate.try_acquire() else {
            return;
        };

        let mut discarded = 0usize;
        while let Ok(Some(event)) = session.poll_next_event(Duration::ZERO).await {
            self.resolve_if_idle(&event).await;
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Dropped stream backlog before first subscriber");
        }
    }

    /// Checked under the slot lock so a concurrent `subscribe` either joins
    /// this task before it retires or spawns a fresh one after.
    fn retire_if_unobserved(&self, tx: &broadcast::Sender<Envelope>) -> bool {
        let mut running = lock(&self.running);
        if tx.receiver_count() > 0 {
            return false;
        }
        running.take();
        true
    }
}

/// One live subscriber's view of the worker stream.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Next envelope, or `None` once the feed is closed. Events lost to lag are
    /// skipped with a warning.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Live subscriber lagged behind worker stream");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Live subscriber lagged behind worker stream");
                }
                Err(_) => return None,
            }
        }
    }

    /// Unbounded stream of envelopes; ends when the feed closes.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send + Unpin {
        BroadcastStream::new(self.rx).filter_map(|item| {
            futures::future::ready(match item {
                Ok(envelope) => Some(envelope),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Live subscriber lagged behind worker stream");
                    None
                }
            })
        })
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
