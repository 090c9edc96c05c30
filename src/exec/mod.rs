//! Execution coordination over a single shared worker stream.
//!
//! Request/response callers, fire-and-forget submitters and live subscribers
//! all share one worker and one output stream. The [`StreamGate`] serializes
//! readers, the [`CorrelationRegistry`] tracks execution deadlines that
//! [`DeadlineEnforcer`]s act on, and [`ExecCoordinator`] ties it together.

mod collector;
mod coordinator;
mod deadline;
mod drain;
mod gate;
mod registry;

pub use collector::ResponseCollector;
pub use coordinator::{ExecCoordinator, Submission};
pub use deadline::{DeadlineEnforcer, EnforcementOutcome};
pub use drain::{DrainExit, LiveFeed, Subscription};
pub use gate::{GateGuard, StreamGate};
pub use registry::CorrelationRegistry;
