//! Worker collaborator: the single long-lived process that executes units of
//! work in submission order and emits one shared event stream.
//!
//! - `event`: stream events, correlation ids, subscriber envelopes
//! - `session`: `WorkerSession` / `WorkerLauncher` traits
//! - `supervisor`: owns the current session (init / teardown / replace)
//! - `shell`: real worker running shell snippets sequentially
//! - `scripted`: in-memory worker for tests

pub mod event;
pub mod scripted;
pub mod session;
pub mod shell;
pub mod supervisor;

pub use event::{CorrelationId, Envelope, StreamEvent};
pub use scripted::{ScriptedLauncher, ScriptedWorker};
pub use session::{WorkerLauncher, WorkerSession};
pub use shell::{ShellLauncher, ShellWorker, ShellWorkerConfig};
pub use supervisor::{WorkerState, WorkerStatus, WorkerSupervisor};
