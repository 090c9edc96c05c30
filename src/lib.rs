//! Flow Exec: coordinates request/response callers, fire-and-forget
//! submitters and live subscribers over one shared execution worker.

pub mod config;
pub mod error;
pub mod exec;
pub mod server;
pub mod worker;
