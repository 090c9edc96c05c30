//! Stream event model shared by every worker implementation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier the worker assigns to each accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Event kinds emitted by the bundled workers.
pub mod kind {
    pub const STATUS: &str = "status";
    pub const STREAM: &str = "stream";
    pub const ERROR: &str = "error";
    pub const EXECUTE_RESULT: &str = "execute_result";
}

/// Values of `execution_state` carried by `status` events.
pub mod state {
    pub const BUSY: &str = "busy";
    pub const IDLE: &str = "idle";
    pub const STARTING: &str = "starting";
}

/// One item pulled off the worker's output stream.
///
/// `parent_correlation_id` links the event to the submission that produced it;
/// lifecycle notices (e.g. `starting` after a restart) carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: String,
    pub parent_correlation_id: Option<CorrelationId>,
    pub payload: serde_json::Value,
}

impl StreamEvent {
    pub fn new(
        kind: impl Into<String>,
        parent: Option<CorrelationId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            parent_correlation_id: parent,
            payload,
        }
    }

    /// `status` event with the given `execution_state`.
    pub fn status(parent: Option<CorrelationId>, execution_state: &str) -> Self {
        Self::new(
            kind::STATUS,
            parent,
            serde_json::json!({ "execution_state": execution_state }),
        )
    }

    pub fn idle(parent: &CorrelationId) -> Self {
        Self::status(Some(parent.clone()), state::IDLE)
    }

    pub fn busy(parent: &CorrelationId) -> Self {
        Self::status(Some(parent.clone()), state::BUSY)
    }

    /// Output written by the running unit on `name` (`stdout` / `stderr`).
    pub fn stream(parent: &CorrelationId, name: &str, text: impl Into<String>) -> Self {
        Self::new(
            kind::STREAM,
            Some(parent.clone()),
            serde_json::json!({ "name": name, "text": text.into() }),
        )
    }

    pub fn error(parent: &CorrelationId, ename: &str, evalue: impl Into<String>) -> Self {
        Self::new(
            kind::ERROR,
            Some(parent.clone()),
            serde_json::json!({ "ename": ename, "evalue": evalue.into() }),
        )
    }

    pub fn execute_result(parent: &CorrelationId, data: serde_json::Value) -> Self {
        Self::new(
            kind::EXECUTE_RESULT,
            Some(parent.clone()),
            serde_json::json!({ "data": data }),
        )
    }

    /// The `execution_state` of a status event.
    pub fn execution_state(&self) -> Option<&str> {
        if self.kind != kind::STATUS {
            return None;
        }
        self.payload.get("execution_state")?.as_str()
    }

    /// The worker finished the unit this event belongs to.
    pub fn is_idle(&self) -> bool {
        self.execution_state() == Some(state::IDLE)
    }

    pub fn belongs_to(&self, id: &CorrelationId) -> bool {
        self.parent_correlation_id.as_ref() == Some(id)
    }

    /// Text of a `stream` event written to `name`.
    pub fn stream_text(&self, name: &str) -> Option<&str> {
        if self.kind != kind::STREAM || self.payload.get("name")?.as_str()? != name {
            return None;
        }
        self.payload.get("text")?.as_str()
    }

    /// Subscriber wire shape for this event.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            kind: self.kind.clone(),
            content: self.payload.clone(),
        }
    }
}

/// `{type, content}` message forwarded verbatim to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
}
