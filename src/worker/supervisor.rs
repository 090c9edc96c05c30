//! Owner of the single worker session.
//!
//! Components never hold the worker ambiently: they ask the supervisor for the
//! current session on every use, so a replacement made by `replace()` is picked
//! up on the next call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::session::{WorkerLauncher, WorkerSession};
use crate::error::WorkerError;

/// Whether a worker session currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Ready,
    Down,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Down => "down",
        };
        write!(f, "{s}")
    }
}

/// Snapshot returned by `WorkerSupervisor::status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    #[serde(rename = "worker")]
    pub state: WorkerState,
    /// When the session last came up or went down.
    pub since: DateTime<Utc>,
}

struct Slot {
    session: Option<Arc<dyn WorkerSession>>,
    since: DateTime<Utc>,
}

/// Process-wide owner of the worker session: init on startup, teardown on
/// shutdown, replace on restart.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    slot: RwLock<Slot>,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            slot: RwLock::new(Slot {
                session: None,
                since: Utc::now(),
            }),
        }
    }

    /// Launch a session if none exists.
    pub async fn init(&self) -> Result<(), WorkerError> {
        let mut slot = self.slot.write().await;
        if slot.session.is_some() {
            return Ok(());
        }
        self.launch_into(&mut slot).await
    }

    /// Shut the current session down and forget it. Shutdown failures are logged.
    pub async fn teardown(&self) {
        let mut slot = self.slot.write().await;
        Self::drop_session(&mut slot).await;
    }

    /// Replace the current session with a freshly launched one.
    ///
    /// On launch failure the supervisor is left without a session and callers
    /// see "not ready" until the next successful replace.
    pub async fn replace(&self) -> Result<(), WorkerError> {
        let mut slot = self.slot.write().await;
        Self::drop_session(&mut slot).await;
        self.launch_into(&mut slot).await
    }

    /// Note that the current session was restarted in place, e.g. after an
    /// execution timeout. No-op while the worker is down.
    pub async fn record_restart(&self) {
        let mut slot = self.slot.write().await;
        if slot.session.is_some() {
            slot.since = Utc::now();
            info!("Worker session restarted in place");
        }
    }

    /// The current session, if the worker is up.
    pub async fn session(&self) -> Option<Arc<dyn WorkerSession>> {
        self.slot.read().await.session.clone()
    }

    pub async fn status(&self) -> WorkerStatus {
        let slot = self.slot.read().await;
        WorkerStatus {
            state: if slot.session.is_some() {
                WorkerState::Ready
            } else {
                WorkerState::Down
            },
            since: slot.since,
        }
    }

    async fn launch_into(&self, slot: &mut Slot) -> Result<(), WorkerError> {
        let session = self.launcher.launch().await?;
        slot.session = Some(session);
        slot.since = Utc::now();
        info!("Worker session started");
        Ok(())
    }

    async fn drop_session(slot: &mut Slot) {
        if let Some(old) = slot.session.take() {
            slot.since = Utc::now();
            if let Err(e) = old.shutdown().await {
                warn!(error = %e, "Worker shutdown failed, dropping session anyway");
            }
            info!("Worker session stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::scripted::{ScriptedLauncher, ScriptedWorker};

    fn supervisor() -> (WorkerSupervisor, Arc<ScriptedLauncher>) {
        let launcher = Arc::new(ScriptedLauncher::new());
        (WorkerSupervisor::new(launcher.clone()), launcher)
    }

    #[tokio::test]
    async fn starts_down() {
        let (supervisor, _) = supervisor();
        assert!(supervisor.session().await.is_none());
        assert_eq!(supervisor.status().await.state, WorkerState::Down);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let (supervisor, launcher) = supervisor();
        supervisor.init().await.unwrap();
        supervisor.init().await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(supervisor.status().await.state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn replace_shuts_down_old_session() {
        let (supervisor, launcher) = supervisor();
        supervisor.init().await.unwrap();
        let first = launcher.latest().unwrap();

        supervisor.replace().await.unwrap();
        let second = launcher.latest().unwrap();

        assert_eq!(first.shutdown_count(), 1);
        assert_eq!(second.shutdown_count(), 0);
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn teardown_leaves_supervisor_down() {
        let (supervisor, launcher) = supervisor();
        supervisor.init().await.unwrap();
        supervisor.teardown().await;

        assert!(supervisor.session().await.is_none());
        assert_eq!(launcher.latest().unwrap().shutdown_count(), 1);
        // Second teardown is a no-op.
        supervisor.teardown().await;
        assert_eq!(launcher.latest().unwrap().shutdown_count(), 1);
    }

    #[tokio::test]
    async fn failed_launch_reports_down() {
        let (supervisor, launcher) = supervisor();
        launcher.fail_next_launch();
        assert!(supervisor.init().await.is_err());
        assert_eq!(supervisor.status().await.state, WorkerState::Down);

        supervisor.replace().await.unwrap();
        assert_eq!(supervisor.status().await.state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn record_restart_moves_since_only_when_up() {
        let (supervisor, _) = supervisor();
        let down_since = supervisor.status().await.since;
        std::thread::sleep(std::time::Duration::from_millis(5));
        supervisor.record_restart().await;
        assert_eq!(supervisor.status().await.since, down_since);

        supervisor.init().await.unwrap();
        let up_since = supervisor.status().await.since;
        std::thread::sleep(std::time::Duration::from_millis(5));
        supervisor.record_restart().await;
        assert!(supervisor.status().await.since > up_since);
        assert_eq!(supervisor.status().await.state, WorkerState::Ready);
    }

    #[tokio::test]
    async fn session_handle_is_shared() {
        let worker = Arc::new(ScriptedWorker::new());
        let supervisor = WorkerSupervisor::new(Arc::new(ScriptedLauncher::with_worker(worker.clone())));
        supervisor.init().await.unwrap();

        let session = supervisor.session().await.unwrap();
        let id = session.submit("x").await.unwrap();
        assert_eq!(worker.submitted(), vec![(id, "x".to_string())]);
    }

    #[test]
    fn status_serializes_as_worker_field() {
        let status = WorkerStatus {
            state: WorkerState::Ready,
            since: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["worker"], "ready");
        assert!(json["since"].is_string());
    }
}
