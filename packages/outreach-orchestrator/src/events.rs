//! Facts flowing across the orchestrator boundary.
//!
//! `WorkerSignal` is what the outside world (worker sessions, the host
//! environment) tells the orchestrator; `StatusUpdate` is what the
//! orchestrator broadcasts to observers on every state mutation.

use serde::Serialize;

use crate::types::{JobId, RunSummary, StatusSnapshot, TaskReport, WorkerHandle};

/// Asynchronous signal from a worker session or the host environment.
#[derive(Debug, Clone)]
pub enum WorkerSignal {
    /// The injected task finished and reported its results.
    Succeeded { job_id: JobId, report: TaskReport },
    /// The injected task ran but signaled an error.
    Failed { job_id: JobId, message: String },
    /// The worker resolved a display name for its target.
    LabelUpdated {
        handle: WorkerHandle,
        label: String,
    },
    /// Incremental progress from inside a still-running task.
    ProgressUpdated {
        handle: WorkerHandle,
        current: usize,
        total: usize,
        stage: Option<String>,
    },
    /// The host destroyed the session outside the orchestrator's control.
    SessionClosed { handle: WorkerHandle },
}

/// Status pushed to observers.
///
/// Emitted synchronously with each state mutation, so an observer that
/// processes updates in delivery order sees a monotonic history per job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    Snapshot(StatusSnapshot),
    RunComplete(RunSummary),
}

impl StatusUpdate {
    /// The snapshot inside, if this is a snapshot update.
    pub fn as_snapshot(&self) -> Option<&StatusSnapshot> {
        match self {
            StatusUpdate::Snapshot(s) => Some(s),
            StatusUpdate::RunComplete(_) => None,
        }
    }

    pub fn is_run_complete(&self) -> bool {
        matches!(self, StatusUpdate::RunComplete(_))
    }
}
