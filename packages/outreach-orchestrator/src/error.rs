//! Structured error types for the orchestrator.
//!
//! Per-job failures never propagate to the caller of `submit_run`; they are
//! folded into job state by the reducer. Only run rejection surfaces
//! synchronously.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why `submit_run` refused to start a run.
///
/// This is the only error the orchestrator returns synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A run is already active; one run at a time.
    #[error("run rejected: a run is already active")]
    RunActive,
    /// The orchestrator has been disabled by its owner.
    #[error("run rejected: orchestrator is disabled")]
    Disabled,
    /// The orchestrator task is no longer running.
    #[error("run rejected: orchestrator is not running")]
    Unavailable,
}

/// Classification of a per-job failure.
///
/// All kinds converge on the same reducer path; the kind is kept for
/// observers and the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not create the worker session or inject the task.
    Dispatch,
    /// The task ran but signaled an error.
    WorkerReported,
    /// The session was destroyed externally mid-job.
    WorkerLost,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Dispatch => "dispatch_failure",
            FailureKind::WorkerReported => "worker_reported_failure",
            FailureKind::WorkerLost => "worker_lost",
        };
        f.write_str(s)
    }
}

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
