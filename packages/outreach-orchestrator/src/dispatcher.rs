//! Dispatch flow for a single job: create the session, let the page
//! settle, inject the runner, start the task.
//!
//! Runs as a spawned task so the actor stays responsive; every outcome is
//! reported back as a message. Holds only a weak sender, so in-flight
//! dispatches never keep a shut-down orchestrator alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::config::RunConfig;
use crate::orchestrator::OrchestratorMsg;
use crate::types::JobId;
use crate::worker::{TaskPayload, WorkerHost};

pub(crate) async fn dispatch(
    host: Arc<dyn WorkerHost>,
    job_id: JobId,
    url: Url,
    config: Arc<RunConfig>,
    settle: Duration,
    tx: mpsc::WeakSender<OrchestratorMsg>,
) {
    let handle = match host.create_session(&url).await {
        Ok(handle) => handle,
        Err(err) => {
            warn!(%job_id, %url, error = %err, "session creation failed");
            send(
                &tx,
                OrchestratorMsg::DispatchFailed {
                    job_id,
                    message: format!("session creation failed: {err:#}"),
                },
            )
            .await;
            return;
        }
    };
    send(&tx, OrchestratorMsg::SessionOpened { job_id, handle }).await;

    // Fixed settle window so slow third-party pages finish their own load
    // before anything is injected.
    tokio::time::sleep(settle).await;

    // The run may have been cancelled while we slept. The actor owns the
    // answer; an orphaned session is torn down on its side.
    let (reply_tx, reply_rx) = oneshot::channel();
    send(
        &tx,
        OrchestratorMsg::ConfirmActive {
            job_id,
            reply: reply_tx,
        },
    )
    .await;
    if !matches!(reply_rx.await, Ok(true)) {
        debug!(%job_id, "dispatch abandoned: job no longer active");
        return;
    }

    if let Err(err) = host.inject_runner(handle).await {
        warn!(%job_id, error = %err, "runner injection failed");
        send(
            &tx,
            OrchestratorMsg::DispatchFailed {
                job_id,
                message: format!("runner injection failed: {err:#}"),
            },
        )
        .await;
        return;
    }

    let payload = TaskPayload {
        job_id,
        config: (*config).clone(),
    };
    if let Err(err) = host.start_task(handle, payload).await {
        warn!(%job_id, error = %err, "task start failed");
        send(
            &tx,
            OrchestratorMsg::DispatchFailed {
                job_id,
                message: format!("task start failed: {err:#}"),
            },
        )
        .await;
        return;
    }

    send(&tx, OrchestratorMsg::TaskStarted { job_id }).await;
}

async fn send(tx: &mpsc::WeakSender<OrchestratorMsg>, msg: OrchestratorMsg) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(msg).await;
    }
}
