use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::error::JobError;

/// Unique identifier for a job.
///
/// Assigned monotonically by the orchestrator and never reset across runs,
/// so a stale signal from a previous run can never alias a live job.
/// Renders as `job_<n>` everywhere it is shown or serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let n = s
            .strip_prefix("job_")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid job id: {s}")))?;
        Ok(JobId(n))
    }
}

/// Opaque reference to a worker session.
///
/// The host environment owns the session; the orchestrator only maps
/// handles back to job ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle(pub Uuid);

impl WorkerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a job.
///
/// `Processing` covers the window between dequeue and session creation,
/// `Loading` the window while the target page settles, and `Running` the
/// window while the injected task is actually executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Loading,
    Running,
    Completed,
    Partial,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Terminal states accept no further signals.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// States in which the job is the single active job of the run.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Processing | JobStatus::Loading | JobStatus::Running
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Loading => "loading",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One unit of work bound to a single target URL.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: Url,
    /// Position in the submitted batch.
    pub index: usize,
    pub status: JobStatus,
    pub worker_handle: Option<WorkerHandle>,
    /// Human-readable name, resolved lazily from worker-reported data.
    pub label: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub report: Option<TaskReport>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(id: JobId, url: Url, index: usize) -> Self {
        Self {
            id,
            url,
            index,
            status: JobStatus::Queued,
            worker_handle: None,
            label: None,
            started_at: None,
            ended_at: None,
            report: None,
            error: None,
        }
    }

    /// Label for display: worker-reported name, falling back to the host.
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.url.host_str().map(str::to_owned))
            .unwrap_or_else(|| self.url.to_string())
    }
}

/// In-job progress reported by the worker before it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
}

/// Result payload reported by a worker on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReport {
    /// Records actually extracted from the page.
    pub record_count: usize,
    /// Count the page claimed to contain, when the worker could read one.
    pub expected_record_count: Option<usize>,
    /// Replies generated by the task.
    pub reply_count: usize,
    /// Raw extracted records; shape is owned by the worker task.
    pub records: Vec<serde_json::Value>,
    /// Free-form per-step log lines from inside the worker.
    pub detailed_log: Vec<String>,
}

impl TaskReport {
    /// Completion rate against the expected count, one decimal place.
    ///
    /// `None` when the worker reported no expected count.
    pub fn completion_rate(&self) -> Option<f64> {
        let expected = self.expected_record_count?;
        if expected == 0 {
            return Some(100.0);
        }
        let rate = self.record_count as f64 / expected as f64 * 100.0;
        Some((rate * 10.0).round() / 10.0)
    }
}

/// One extracted record, tagged with its origin job.
///
/// Duplicates across repeated runs of the same URL are permitted and
/// never deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEntry {
    pub job_id: JobId,
    pub url: Url,
    pub data: serde_json::Value,
    pub collected_at: DateTime<Utc>,
}

/// One detailed log line from a worker, tagged with its origin job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub url: Url,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Denormalized, UI-facing view of a job. Rebuilt on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: JobId,
    pub url: Url,
    pub index: usize,
    pub status: JobStatus,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    /// Free-text stage reported alongside progress updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_rate: Option<f64>,
}

/// Aggregate counters for one run. Reset wholesale at every submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Jobs that reached a completed-or-error terminal state.
    pub current: usize,
    /// Jobs in the run.
    pub total: usize,
    pub record_count: usize,
    pub reply_count: usize,
    pub error_count: usize,
}

/// Terminal summary emitted once the queue drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub records: Vec<RecordEntry>,
    /// Per-step log lines collected from every worker, in arrival order.
    pub detailed_log: Vec<LogEntry>,
    pub duration_ms: u64,
    pub stats: SummaryStats,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SummaryStats {
    pub record_count: usize,
    pub reply_count: usize,
    pub error_count: usize,
    pub targets_processed: usize,
}

/// Read-only view of the whole run, served to pull-style observers.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub active: bool,
    pub stats: RunStats,
    /// One snapshot per job, in submission order.
    pub snapshots: Vec<StatusSnapshot>,
    pub activity: Vec<ActivityEntry>,
}

/// One line of the rolling activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Bounded rolling log of orchestrator transitions.
///
/// Oldest entries are evicted once the cap is reached.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    cap: usize,
}

impl ActivityLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(ActivityEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }
}
