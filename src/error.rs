//! Error types for flow-exec.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures reported by a worker session or its launcher.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker is not running")]
    NotRunning,

    #[error("Failed to launch worker: {reason}")]
    LaunchFailed { reason: String },

    #[error("Stream poll failed: {reason}")]
    Poll { reason: String },

    #[error("Event stream closed")]
    StreamClosed,

    #[error("Worker {operation} failed: {reason}")]
    Lifecycle {
        operation: &'static str,
        reason: String,
    },
}

impl WorkerError {
    /// Whether a stream-polling failure is a hiccup worth retrying on the next tick.
    ///
    /// Only a closed stream is unrecoverable; everything else may clear up once
    /// the supervisor swaps in a fresh session.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::StreamClosed)
    }

    pub(crate) fn lifecycle(operation: &'static str, reason: impl ToString) -> Self {
        Self::Lifecycle {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced synchronously to callers of the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("worker not ready")]
    NotReady,

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
