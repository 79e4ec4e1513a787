//! Parallel execution
//!
//! The scheduler consumes the assembled plan and dispatches units onto a
//! bounded pool of worker subprocesses; the worker driver owns one
//! subprocess end to end.

mod scheduler;
mod worker;

pub use scheduler::{run_plan, RunSummary, SkippedUnit, UnitResult};
pub use worker::{
    QueueItem, WorkerContext, WorkerOutcome, WorkerResult, ENV_CALLER_ID, ENV_LIB_URI,
    ENV_POOL_ID, ENV_PROCESS_COUNT, ENV_QUEUE_INDEX,
};

use thiserror::Error;

/// A worker subprocess could not be started at all. Fatal: the whole run
/// is drained and aborted.
#[derive(Debug, Error)]
#[error("failed to start worker for '{name}': {source}")]
pub struct SpawnError {
    pub name: String,
    #[source]
    pub source: std::io::Error,
}
