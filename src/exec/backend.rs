// src/exec/backend.rs

//! Pluggable runner abstraction.
//!
//! The engine talks to a `RunnerBackend` instead of spawning processes
//! itself. Production code uses [`ProcessRunner`](super::ProcessRunner);
//! tests provide fakes that record dispatches and emit completions on
//! demand.
//!
//! Dispatch is fire-and-forget: it returns as soon as the runner accepted
//! the task. Completions and log lines come back asynchronously as
//! [`RuntimeEvent`](crate::engine::RuntimeEvent)s.

use crate::dag::ScheduledTask;
use crate::errors::Result;
use crate::types::{BoxFuture, CorrelationId};

pub trait RunnerBackend: Send + Sync {
    /// Start executing `task`. An error means the task never started and is
    /// treated as an infrastructure fault.
    fn dispatch(&self, task: ScheduledTask) -> BoxFuture<'_, Result<CorrelationId>>;

    /// Best-effort stop of an in-flight task. No completion is reported for a
    /// cancelled task. Unknown correlations are not an error.
    fn cancel<'a>(&'a self, correlation: &'a CorrelationId) -> BoxFuture<'a, Result<()>>;
}
