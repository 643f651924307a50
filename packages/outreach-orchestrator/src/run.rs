//! Pure run state machine: job queue, status registry, run aggregate, and
//! the completion/error reducer.
//!
//! This module does no IO and never awaits. Every handler mutates state and
//! returns the side effects the async shell must execute, in order. Status
//! publishes are therefore emitted synchronously with each mutation, which
//! is what gives observers a monotonic per-job history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{RunConfig, Timings};
use crate::error::{FailureKind, JobError, SubmitError};
use crate::events::StatusUpdate;
use crate::types::{
    ActivityLog, Job, JobId, JobStatus, LogEntry, RecordEntry, RunStats, RunSummary, RunView,
    StatusSnapshot, SummaryStats, TaskProgress, WorkerHandle,
};

/// Side effect for the async shell to execute.
#[derive(Debug)]
pub(crate) enum RunEffect {
    /// Push an update to observers.
    Publish(StatusUpdate),
    /// Spawn a dispatch for the job.
    Dispatch {
        job_id: JobId,
        url: Url,
        config: Arc<RunConfig>,
    },
    /// Tear the session down after the given delay; errors are swallowed.
    Teardown {
        handle: WorkerHandle,
        after: Duration,
    },
    /// Re-enter `advance` after the given delay.
    ScheduleAdvance { after: Duration },
}

/// All mutable orchestrator state. Single writer: the actor task.
pub(crate) struct RunState {
    jobs: Vec<Job>,
    registry: HashMap<JobId, StatusSnapshot>,
    handle_index: HashMap<WorkerHandle, JobId>,
    stats: RunStats,
    records: Vec<RecordEntry>,
    detailed_log: Vec<LogEntry>,
    activity: ActivityLog,
    config: Arc<RunConfig>,
    timings: Timings,
    active_job: Option<JobId>,
    run_active: bool,
    started_at: Option<DateTime<Utc>>,
    enabled: bool,
    /// Monotonic across runs, so stale cross-run signals miss the id guard.
    next_job_id: u64,
}

impl RunState {
    pub(crate) fn new(timings: Timings, activity_cap: usize) -> Self {
        Self {
            jobs: Vec::new(),
            registry: HashMap::new(),
            handle_index: HashMap::new(),
            stats: RunStats::default(),
            records: Vec::new(),
            detailed_log: Vec::new(),
            activity: ActivityLog::new(activity_cap),
            config: Arc::new(RunConfig::default()),
            timings,
            active_job: None,
            run_active: false,
            started_at: None,
            enabled: true,
            next_job_id: 1,
        }
    }

    // ========================================================================
    // Public surface: submit / cancel / read
    // ========================================================================

    /// Start a new run, replacing all prior run state wholesale.
    pub(crate) fn begin_run(
        &mut self,
        targets: Vec<Url>,
        config: RunConfig,
    ) -> Result<Vec<RunEffect>, SubmitError> {
        if !self.enabled {
            return Err(SubmitError::Disabled);
        }
        if self.run_active {
            return Err(SubmitError::RunActive);
        }

        let mut effects = Vec::new();

        // A prior run with auto_close disabled may have left sessions open.
        for handle in self.handle_index.drain().map(|(h, _)| h) {
            effects.push(RunEffect::Teardown {
                handle,
                after: Duration::ZERO,
            });
        }

        self.jobs.clear();
        self.registry.clear();
        self.records.clear();
        self.detailed_log.clear();
        self.stats = RunStats {
            total: targets.len(),
            ..RunStats::default()
        };
        self.config = Arc::new(config);
        self.active_job = None;
        self.started_at = Some(Utc::now());
        self.run_active = true;

        info!(targets = self.stats.total, "run started");
        self.activity
            .push(format!("run started with {} targets", self.stats.total));

        for (index, url) in targets.into_iter().enumerate() {
            let id = JobId(self.next_job_id);
            self.next_job_id += 1;
            self.jobs.push(Job::new(id, url, index));
            let snap = self.refresh_snapshot(index);
            effects.push(RunEffect::Publish(StatusUpdate::Snapshot(snap)));
        }

        effects.extend(self.advance());
        Ok(effects)
    }

    /// Force every non-terminal job to cancelled and tear all sessions down.
    /// Idempotent; emits no run-complete summary.
    pub(crate) fn cancel(&mut self) -> Vec<RunEffect> {
        let mut effects = Vec::new();
        let had_work = self.run_active || self.jobs.iter().any(|j| !j.status.is_terminal());
        if !had_work {
            debug!("cancel with no active run is a no-op");
            return effects;
        }

        let now = Utc::now();
        for idx in 0..self.jobs.len() {
            if self.jobs[idx].status.is_terminal() {
                continue;
            }
            {
                let job = &mut self.jobs[idx];
                job.status = JobStatus::Cancelled;
                job.ended_at = Some(now);
            }
            let snap = self.refresh_snapshot(idx);
            effects.push(RunEffect::Publish(StatusUpdate::Snapshot(snap)));
        }

        for (handle, _) in self.handle_index.drain() {
            effects.push(RunEffect::Teardown {
                handle,
                after: Duration::ZERO,
            });
        }
        for job in &mut self.jobs {
            job.worker_handle = None;
        }

        self.active_job = None;
        self.run_active = false;
        info!("run cancelled");
        self.activity.push("run cancelled");
        effects
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(enabled, "orchestrator enabled flag changed");
            self.activity.push(if enabled {
                "orchestrator enabled"
            } else {
                "orchestrator disabled"
            });
        }
        self.enabled = enabled;
    }

    /// Pure read of the whole run.
    pub(crate) fn view(&self) -> RunView {
        debug_assert!(self.snapshot_parity(), "registry must mirror jobs");
        RunView {
            active: self.run_active,
            stats: self.stats.clone(),
            snapshots: self
                .jobs
                .iter()
                .filter_map(|j| self.registry.get(&j.id).cloned())
                .collect(),
            activity: self.activity.to_vec(),
        }
    }

    // ========================================================================
    // Drain
    // ========================================================================

    /// Dequeue the first queued job, or finish the run when none is left.
    ///
    /// Only re-entered by the reducer after a terminal transition (plus the
    /// advance delay), which is what keeps progression strictly serial.
    pub(crate) fn advance(&mut self) -> Vec<RunEffect> {
        if !self.run_active {
            debug!("advance after run ended is a no-op");
            return Vec::new();
        }
        if let Some(active) = self.active_job {
            // A stale timer fired while a job is still in flight.
            debug!(%active, "advance skipped: job already active");
            return Vec::new();
        }

        let Some(idx) = self.jobs.iter().position(|j| j.status == JobStatus::Queued) else {
            return self.finish_run();
        };

        {
            let job = &mut self.jobs[idx];
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            self.active_job = Some(job.id);
            info!(job_id = %job.id, url = %job.url, "job dequeued");
        }
        let snap = self.refresh_snapshot(idx);
        let job = &self.jobs[idx];
        self.activity.push(format!("{} processing {}", job.id, job.url));

        vec![
            RunEffect::Publish(StatusUpdate::Snapshot(snap)),
            RunEffect::Dispatch {
                job_id: job.id,
                url: job.url.clone(),
                config: Arc::clone(&self.config),
            },
        ]
    }

    fn finish_run(&mut self) -> Vec<RunEffect> {
        self.run_active = false;
        let duration_ms = self
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let summary = RunSummary {
            records: self.records.clone(),
            detailed_log: self.detailed_log.clone(),
            duration_ms,
            stats: SummaryStats {
                record_count: self.stats.record_count,
                reply_count: self.stats.reply_count,
                error_count: self.stats.error_count,
                targets_processed: self.stats.current,
            },
        };
        info!(
            targets_processed = summary.stats.targets_processed,
            records = summary.stats.record_count,
            errors = summary.stats.error_count,
            duration_ms,
            "run complete"
        );
        self.activity.push(format!(
            "run complete: {} targets, {} records, {} errors",
            summary.stats.targets_processed, summary.stats.record_count, summary.stats.error_count
        ));
        vec![RunEffect::Publish(StatusUpdate::RunComplete(summary))]
    }

    // ========================================================================
    // Dispatch lifecycle callbacks
    // ========================================================================

    /// The dispatcher created a session for the job.
    pub(crate) fn session_opened(
        &mut self,
        job_id: JobId,
        handle: WorkerHandle,
    ) -> Vec<RunEffect> {
        let Some(idx) = self.job_index(job_id) else {
            debug!(%job_id, "session opened for unknown job; closing");
            return vec![RunEffect::Teardown {
                handle,
                after: Duration::ZERO,
            }];
        };
        if self.jobs[idx].status != JobStatus::Processing || self.active_job != Some(job_id) {
            // Cancel (or a stale dispatch) won the race; the session is orphaned.
            debug!(%job_id, status = %self.jobs[idx].status, "session opened for inactive job; closing");
            return vec![RunEffect::Teardown {
                handle,
                after: Duration::ZERO,
            }];
        }

        {
            let job = &mut self.jobs[idx];
            job.worker_handle = Some(handle);
            job.status = JobStatus::Loading;
        }
        self.handle_index.insert(handle, job_id);
        debug!(%job_id, %handle, "worker session opened");
        let snap = self.refresh_snapshot(idx);
        vec![RunEffect::Publish(StatusUpdate::Snapshot(snap))]
    }

    /// Dispatcher's recheck before injecting task code.
    pub(crate) fn confirm_active(&self, job_id: JobId) -> bool {
        self.run_active && self.active_job == Some(job_id)
    }

    /// Task code was injected and triggered; the worker is now executing.
    pub(crate) fn task_started(&mut self, job_id: JobId) -> Vec<RunEffect> {
        let Some(idx) = self.job_index(job_id) else {
            debug!(%job_id, "task started for unknown job discarded");
            return Vec::new();
        };
        if self.jobs[idx].status != JobStatus::Loading {
            debug!(%job_id, status = %self.jobs[idx].status, "task started out of order discarded");
            return Vec::new();
        }
        self.jobs[idx].status = JobStatus::Running;
        debug!(%job_id, "worker task running");
        let snap = self.refresh_snapshot(idx);
        vec![RunEffect::Publish(StatusUpdate::Snapshot(snap))]
    }

    /// The teardown task finished (or the close failed and was swallowed);
    /// release the handle mapping either way.
    pub(crate) fn session_released(&mut self, handle: WorkerHandle) {
        if let Some(job_id) = self.handle_index.remove(&handle) {
            if let Some(idx) = self.job_index(job_id) {
                self.jobs[idx].worker_handle = None;
            }
        }
    }

    // ========================================================================
    // Completion/error reducer
    // ========================================================================

    /// Fold a success signal into job + aggregate state.
    pub(crate) fn on_success(
        &mut self,
        job_id: JobId,
        report: crate::types::TaskReport,
    ) -> Vec<RunEffect> {
        let Some(idx) = self.guarded_index(job_id) else {
            return Vec::new();
        };

        let status = match report.expected_record_count {
            Some(expected) if expected != report.record_count => JobStatus::Partial,
            _ => JobStatus::Completed,
        };

        let now = Utc::now();
        {
            let url = self.jobs[idx].url.clone();
            for data in &report.records {
                self.records.push(RecordEntry {
                    job_id,
                    url: url.clone(),
                    data: data.clone(),
                    collected_at: now,
                });
            }
            for line in &report.detailed_log {
                self.detailed_log.push(LogEntry {
                    job_id,
                    url: url.clone(),
                    message: line.clone(),
                    at: now,
                });
            }
        }
        self.stats.record_count += report.record_count;
        self.stats.reply_count += report.reply_count;
        self.stats.current += 1;

        match status {
            JobStatus::Partial => {
                let rate = report.completion_rate().unwrap_or(0.0);
                warn!(%job_id, rate, found = report.record_count, expected = ?report.expected_record_count, "job completed partially");
                self.activity
                    .push(format!("{job_id} partial ({rate:.1}% of expected records)"));
            }
            _ => {
                info!(%job_id, records = report.record_count, replies = report.reply_count, "job completed");
                self.activity.push(format!(
                    "{job_id} completed ({} records, {} replies)",
                    report.record_count, report.reply_count
                ));
            }
        }

        {
            let job = &mut self.jobs[idx];
            job.status = status;
            job.ended_at = Some(now);
            job.report = Some(report);
        }

        let snap = self.refresh_snapshot(idx);
        let mut effects = vec![RunEffect::Publish(StatusUpdate::Snapshot(snap))];
        effects.extend(self.resolve_tail(idx));
        effects
    }

    /// Fold a failure signal into job + aggregate state.
    ///
    /// Dispatch failures, worker-reported failures, and lost workers all
    /// land here; a failed job never halts the run.
    pub(crate) fn on_failure(
        &mut self,
        job_id: JobId,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Vec<RunEffect> {
        let Some(idx) = self.guarded_index(job_id) else {
            return Vec::new();
        };

        let err = JobError::new(kind, message);
        error!(%job_id, %kind, message = %err.message, "job failed");
        self.activity.push(format!("{job_id} error: {}", err.message));

        self.stats.error_count += 1;
        self.stats.current += 1;
        {
            let job = &mut self.jobs[idx];
            job.status = JobStatus::Error;
            job.ended_at = Some(Utc::now());
            job.error = Some(err);
        }

        let snap = self.refresh_snapshot(idx);
        let mut effects = vec![RunEffect::Publish(StatusUpdate::Snapshot(snap))];
        effects.extend(self.resolve_tail(idx));
        effects
    }

    /// Worker resolved a display name. Snapshot-only; status untouched.
    pub(crate) fn label_updated(&mut self, handle: WorkerHandle, label: String) -> Vec<RunEffect> {
        let Some(idx) = self.live_index_for_handle(handle) else {
            return Vec::new();
        };
        self.jobs[idx].label = Some(label);
        let snap = self.refresh_snapshot(idx);
        vec![RunEffect::Publish(StatusUpdate::Snapshot(snap))]
    }

    /// Worker reported incremental progress. Snapshot-only; status untouched.
    pub(crate) fn progress_updated(
        &mut self,
        handle: WorkerHandle,
        current: usize,
        total: usize,
        stage: Option<String>,
    ) -> Vec<RunEffect> {
        let Some(idx) = self.live_index_for_handle(handle) else {
            return Vec::new();
        };
        let job_id = self.jobs[idx].id;
        let Some(snap) = self.registry.get_mut(&job_id) else {
            return Vec::new();
        };
        snap.progress = Some(TaskProgress { current, total });
        if stage.is_some() {
            snap.stage = stage;
        }
        vec![RunEffect::Publish(StatusUpdate::Snapshot(snap.clone()))]
    }

    /// The host destroyed a session out from under us.
    pub(crate) fn session_closed(&mut self, handle: WorkerHandle) -> Vec<RunEffect> {
        let Some(job_id) = self.handle_index.remove(&handle) else {
            debug!(%handle, "close notice for unknown session discarded");
            return Vec::new();
        };
        let Some(idx) = self.job_index(job_id) else {
            return Vec::new();
        };
        self.jobs[idx].worker_handle = None;
        if self.jobs[idx].status.is_terminal() {
            debug!(%job_id, "session closed after job resolved");
            return Vec::new();
        }
        self.on_failure(job_id, FailureKind::WorkerLost, "worker closed unexpectedly")
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Shared tail of every terminal transition: optional teardown, clear the
    /// active pointer, schedule the next dequeue.
    fn resolve_tail(&mut self, idx: usize) -> Vec<RunEffect> {
        let mut effects = Vec::new();
        let job_id = self.jobs[idx].id;

        if self.config.auto_close {
            if let Some(handle) = self.jobs[idx].worker_handle {
                effects.push(RunEffect::Teardown {
                    handle,
                    after: self.timings.teardown_grace,
                });
            }
        }

        if self.active_job == Some(job_id) {
            self.active_job = None;
        }
        if self.run_active {
            effects.push(RunEffect::ScheduleAdvance {
                after: self.timings.advance_delay,
            });
        }
        effects
    }

    /// Index of a job that may still receive completion signals.
    ///
    /// Unknown ids, terminal jobs, and jobs that were never dispatched are
    /// all discarded here — the duplicate/stale-signal guard.
    fn guarded_index(&self, job_id: JobId) -> Option<usize> {
        let Some(idx) = self.job_index(job_id) else {
            debug!(%job_id, "signal for unknown job discarded");
            return None;
        };
        let status = self.jobs[idx].status;
        if status.is_terminal() {
            debug!(%job_id, %status, "signal for resolved job discarded");
            return None;
        }
        if !status.is_active() {
            debug!(%job_id, %status, "signal for undispatched job discarded");
            return None;
        }
        Some(idx)
    }

    /// Index for a side-channel update keyed by handle; terminal jobs are
    /// stale.
    fn live_index_for_handle(&self, handle: WorkerHandle) -> Option<usize> {
        let Some(&job_id) = self.handle_index.get(&handle) else {
            debug!(%handle, "update for unknown session discarded");
            return None;
        };
        let idx = self.job_index(job_id)?;
        if self.jobs[idx].status.is_terminal() {
            debug!(%job_id, "update for resolved job discarded");
            return None;
        }
        Some(idx)
    }

    fn job_index(&self, job_id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == job_id)
    }

    /// Rebuild the denormalized snapshot for a job, preserving the
    /// side-channel fields (progress, stage) the job itself doesn't carry.
    fn refresh_snapshot(&mut self, idx: usize) -> StatusSnapshot {
        let job = &self.jobs[idx];
        let prev = self.registry.get(&job.id);
        let snap = StatusSnapshot {
            job_id: job.id,
            url: job.url.clone(),
            index: job.index,
            status: job.status,
            label: job.display_label(),
            progress: prev.and_then(|p| p.progress),
            stage: prev.and_then(|p| p.stage.clone()),
            started_at: job.started_at,
            ended_at: job.ended_at,
            error: job.error.as_ref().map(|e| e.message.clone()),
            completion_rate: job.report.as_ref().and_then(|r| r.completion_rate()),
        };
        self.registry.insert(job.id, snap.clone());
        snap
    }

    // Test-facing accessors (the actor uses the handlers above only).

    #[cfg(test)]
    pub(crate) fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub(crate) fn snapshot_parity(&self) -> bool {
        self.registry.len() == self.jobs.len()
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &RunStats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn is_run_active(&self) -> bool {
        self.run_active
    }
}
