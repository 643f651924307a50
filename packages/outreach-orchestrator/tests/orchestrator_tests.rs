//! End-to-end tests driving the orchestrator through a mock worker host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use url::Url;

use outreach_orchestrator::{
    JobId, JobStatus, OrchestratorBuilder, OrchestratorHandle, ProcessingMode, RunConfig,
    RunSummary, StatusSnapshot, StatusUpdate, SubmitError, TaskPayload, TaskProgress, TaskReport,
    Timings, WorkerHandle, WorkerHost,
};

/// Host double: hands out handles, records calls, and notifies the test on
/// every started task so it can play the worker's part.
struct MockWorkerHost {
    create_failures: AtomicUsize,
    start_failures: AtomicUsize,
    created: Mutex<Vec<Url>>,
    closed: Mutex<Vec<WorkerHandle>>,
    started_tx: mpsc::UnboundedSender<(WorkerHandle, TaskPayload)>,
}

impl MockWorkerHost {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(WorkerHandle, TaskPayload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            create_failures: AtomicUsize::new(0),
            start_failures: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            started_tx: tx,
        });
        (host, rx)
    }

    fn fail_next_creates(&self, n: usize) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    fn closed_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

fn consume_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl WorkerHost for MockWorkerHost {
    async fn create_session(&self, url: &Url) -> Result<WorkerHandle> {
        if consume_failure(&self.create_failures) {
            bail!("mock refused to create a session");
        }
        self.created.lock().unwrap().push(url.clone());
        Ok(WorkerHandle::new())
    }

    async fn inject_runner(&self, _handle: WorkerHandle) -> Result<()> {
        Ok(())
    }

    async fn start_task(&self, handle: WorkerHandle, payload: TaskPayload) -> Result<()> {
        if consume_failure(&self.start_failures) {
            bail!("mock refused to start the task");
        }
        let _ = self.started_tx.send((handle, payload));
        Ok(())
    }

    async fn close_session(&self, handle: WorkerHandle) -> Result<()> {
        self.closed.lock().unwrap().push(handle);
        Ok(())
    }
}

fn spawn_fast(host: Arc<MockWorkerHost>) -> OrchestratorHandle {
    OrchestratorBuilder::new()
        .with_timings(Timings::fast())
        .spawn(host)
}

fn url(i: usize) -> Url {
    Url::parse(&format!("https://example.com/listing/{i}")).unwrap()
}

fn report(records: usize, expected: Option<usize>) -> TaskReport {
    TaskReport {
        record_count: records,
        expected_record_count: expected,
        reply_count: records,
        records: (0..records)
            .map(|i| serde_json::json!({ "record": i }))
            .collect(),
        detailed_log: vec![format!("extracted {records} records")],
    }
}

async fn next_start(
    rx: &mut mpsc::UnboundedReceiver<(WorkerHandle, TaskPayload)>,
) -> (WorkerHandle, TaskPayload) {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no task started in time")
        .expect("mock channel closed")
}

/// Collect broadcast updates until the run-complete summary arrives.
async fn drain_run(
    rx: &mut broadcast::Receiver<StatusUpdate>,
) -> (Vec<StatusSnapshot>, RunSummary) {
    let mut snapshots = Vec::new();
    loop {
        let update = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("run did not complete in time")
            .expect("status channel closed");
        match update {
            StatusUpdate::Snapshot(s) => snapshots.push(s),
            StatusUpdate::RunComplete(summary) => return (snapshots, summary),
        }
    }
}

fn status_sequence(snapshots: &[StatusSnapshot], id: JobId) -> Vec<JobStatus> {
    snapshots
        .iter()
        .filter(|s| s.job_id == id)
        .map(|s| s.status)
        .collect()
}

#[tokio::test]
async fn run_drains_serially_and_reports_summary() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host.clone());
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1), url(2)], RunConfig::default())
        .await
        .unwrap();

    let driver = {
        let orch = orch.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                let (_, payload) = next_start(&mut started).await;
                orch.report_success(payload.job_id, report(2, Some(2))).await;
            }
        })
    };

    let (snapshots, summary) = drain_run(&mut updates).await;
    driver.await.unwrap();

    assert_eq!(summary.stats.targets_processed, 2);
    assert_eq!(summary.stats.record_count, 4);
    assert_eq!(summary.stats.error_count, 0);
    assert_eq!(summary.records.len(), 4);

    let full = vec![
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Loading,
        JobStatus::Running,
        JobStatus::Completed,
    ];
    assert_eq!(status_sequence(&snapshots, JobId(1)), full);
    assert_eq!(status_sequence(&snapshots, JobId(2)), full);

    // Strictly serial: job_2 only starts once job_1 has resolved.
    let j1_done = snapshots
        .iter()
        .position(|s| s.job_id == JobId(1) && s.status.is_terminal())
        .unwrap();
    let j2_start = snapshots
        .iter()
        .position(|s| s.job_id == JobId(2) && s.status == JobStatus::Processing)
        .unwrap();
    assert!(j1_done < j2_start);

    let view = orch.snapshot().await.unwrap();
    assert!(!view.active);
    assert_eq!(view.stats.current, 2);
    assert_eq!(host.created.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_dispatch_marks_job_error_and_run_continues() {
    let (host, mut started) = MockWorkerHost::new();
    host.fail_next_creates(1);
    let orch = spawn_fast(host.clone());
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1), url(2)], RunConfig::default())
        .await
        .unwrap();

    let driver = {
        let orch = orch.clone();
        tokio::spawn(async move {
            let (_, payload) = next_start(&mut started).await;
            orch.report_success(payload.job_id, report(1, None)).await;
        })
    };

    let (snapshots, summary) = drain_run(&mut updates).await;
    driver.await.unwrap();

    assert_eq!(summary.stats.error_count, 1);
    assert_eq!(summary.stats.targets_processed, 2);

    let err_snap = snapshots
        .iter()
        .find(|s| s.job_id == JobId(1) && s.status == JobStatus::Error)
        .expect("error snapshot for the failed job");
    assert!(err_snap
        .error
        .as_deref()
        .unwrap()
        .contains("session creation failed"));

    assert_eq!(
        status_sequence(&snapshots, JobId(2)).last(),
        Some(&JobStatus::Completed)
    );
}

#[tokio::test]
async fn worker_reported_failure_keeps_its_message() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let (_, payload) = next_start(&mut started).await;
    orch.report_failure(payload.job_id, "selector not found")
        .await;

    let (snapshots, summary) = drain_run(&mut updates).await;
    assert_eq!(summary.stats.error_count, 1);
    let err_snap = snapshots
        .iter()
        .find(|s| s.status == JobStatus::Error)
        .unwrap();
    assert_eq!(err_snap.error.as_deref(), Some("selector not found"));
}

#[tokio::test]
async fn cancel_tears_down_and_stops_dispatch() {
    let (host, mut started) = MockWorkerHost::new();
    // Park the dispatcher in a long settle window so cancel wins the race.
    let timings = Timings::fast().with_settle(Duration::from_secs(30));
    let orch = OrchestratorBuilder::new()
        .with_timings(timings)
        .spawn(host.clone());
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1), url(2)], RunConfig::default())
        .await
        .unwrap();

    // Wait until the session exists before cancelling.
    loop {
        let update = timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("no loading update")
            .unwrap();
        if matches!(update, StatusUpdate::Snapshot(s) if s.status == JobStatus::Loading) {
            break;
        }
    }

    orch.cancel_run().await;

    // The parked dispatcher rechecks and abandons; the task never starts.
    assert!(timeout(Duration::from_millis(100), started.recv())
        .await
        .is_err());

    let view = orch.snapshot().await.unwrap();
    assert!(!view.active);
    assert!(view
        .snapshots
        .iter()
        .all(|s| s.status == JobStatus::Cancelled));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.closed_count(), 1);
}

#[tokio::test]
async fn second_submit_rejected_while_run_active() {
    let (host, _started) = MockWorkerHost::new();
    let timings = Timings::fast().with_settle(Duration::from_secs(30));
    let orch = OrchestratorBuilder::new().with_timings(timings).spawn(host);

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let err = orch
        .submit_run(vec![url(2)], RunConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::RunActive);

    // The rejected submission left the active run untouched.
    let view = orch.snapshot().await.unwrap();
    assert!(view.active);
    assert_eq!(view.snapshots.len(), 1);
    assert_eq!(view.snapshots[0].url, url(1));
}

#[tokio::test]
async fn lost_session_fails_job_and_run_finishes() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let (handle, _) = next_start(&mut started).await;
    orch.session_closed(handle).await;

    let (snapshots, summary) = drain_run(&mut updates).await;
    assert_eq!(summary.stats.error_count, 1);
    assert_eq!(summary.stats.targets_processed, 1);
    let err_snap = snapshots
        .iter()
        .find(|s| s.status == JobStatus::Error)
        .unwrap();
    assert_eq!(err_snap.error.as_deref(), Some("worker closed unexpectedly"));
}

#[tokio::test]
async fn short_record_count_yields_partial() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let (_, payload) = next_start(&mut started).await;
    orch.report_success(payload.job_id, report(3, Some(5))).await;

    let (snapshots, summary) = drain_run(&mut updates).await;
    let partial = snapshots
        .iter()
        .find(|s| s.status == JobStatus::Partial)
        .expect("partial snapshot");
    assert_eq!(partial.completion_rate, Some(60.0));
    assert_eq!(summary.stats.record_count, 3);
    assert_eq!(summary.stats.error_count, 0);
}

#[tokio::test]
async fn label_and_progress_updates_reach_observers() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let (handle, payload) = next_start(&mut started).await;

    orch.update_label(handle, "Maple Street Listing").await;
    orch.update_progress(handle, 1, 4, Some("extracting".into()))
        .await;
    orch.report_success(payload.job_id, report(4, None)).await;

    let (snapshots, _) = drain_run(&mut updates).await;
    assert!(snapshots
        .iter()
        .any(|s| s.label == "Maple Street Listing" && s.status == JobStatus::Running));
    assert!(snapshots
        .iter()
        .any(|s| s.progress == Some(TaskProgress { current: 1, total: 4 })
            && s.stage.as_deref() == Some("extracting")));

    // Side-channel data survives into the terminal snapshot.
    let done = snapshots
        .iter()
        .find(|s| s.status == JobStatus::Completed)
        .unwrap();
    assert_eq!(done.label, "Maple Street Listing");
}

#[tokio::test]
async fn task_payload_carries_run_config() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);

    let config = RunConfig::default()
        .with_auto_reply(true)
        .with_mode(ProcessingMode::Assistant {
            model: "gpt-4o-mini".into(),
            prompt: Some("be brief".into()),
        });
    orch.submit_run(vec![url(1)], config).await.unwrap();

    let (_, payload) = next_start(&mut started).await;
    assert_eq!(payload.job_id, JobId(1));
    assert!(payload.config.auto_reply);
    assert!(matches!(
        payload.config.mode,
        ProcessingMode::Assistant { ref model, .. } if model == "gpt-4o-mini"
    ));
    orch.cancel_run().await;
}

#[tokio::test]
async fn sessions_are_closed_after_completion() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host.clone());
    let mut updates = orch.subscribe();

    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    let (_, payload) = next_start(&mut started).await;
    orch.report_success(payload.job_id, report(1, None)).await;
    drain_run(&mut updates).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.closed_count(), 1);
}

#[tokio::test]
async fn disabled_orchestrator_rejects_until_reenabled() {
    let (host, mut started) = MockWorkerHost::new();
    let orch = spawn_fast(host);

    orch.set_enabled(false).await;
    let err = orch
        .submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::Disabled);

    orch.set_enabled(true).await;
    orch.submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap();
    next_start(&mut started).await;
    orch.cancel_run().await;
}

#[tokio::test]
async fn shutdown_rejects_later_submissions() {
    let (host, _started) = MockWorkerHost::new();
    let orch = spawn_fast(host);

    orch.shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = orch
        .submit_run(vec![url(1)], RunConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::Unavailable);
}
