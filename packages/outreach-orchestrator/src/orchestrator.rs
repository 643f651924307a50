//! Orchestrator actor and the handle callers hold on to.
//!
//! All state lives inside a single task; everything else talks to it over
//! a command channel. The actor applies pure state transitions and then
//! executes the effects they return (publishes, spawned dispatches,
//! delayed teardowns and advances).

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use url::Url;

use crate::broadcast::StatusHub;
use crate::config::{RunConfig, Timings};
use crate::dispatcher;
use crate::error::{FailureKind, SubmitError};
use crate::events::{StatusUpdate, WorkerSignal};
use crate::run::{RunEffect, RunState};
use crate::types::{JobId, RunView, TaskReport, WorkerHandle};
use crate::worker::WorkerHost;

const COMMAND_BUFFER: usize = 64;
const DEFAULT_ACTIVITY_CAP: usize = 500;

/// Everything the actor can be told, by callers and by its own spawned
/// tasks.
pub(crate) enum OrchestratorMsg {
    SubmitRun {
        targets: Vec<Url>,
        config: RunConfig,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    CancelRun,
    Snapshot {
        reply: oneshot::Sender<RunView>,
    },
    SetEnabled(bool),
    Shutdown,
    /// Signal from a worker session or the host environment.
    Signal(WorkerSignal),
    /// Dispatcher created a session for the job.
    SessionOpened {
        job_id: JobId,
        handle: WorkerHandle,
    },
    /// Dispatcher could not get the task running.
    DispatchFailed {
        job_id: JobId,
        message: String,
    },
    /// Dispatcher triggered the task entry point.
    TaskStarted {
        job_id: JobId,
    },
    /// Dispatcher's recheck after the settle window.
    ConfirmActive {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    /// A scheduled advance timer fired.
    Advance,
    /// A teardown task finished with this handle.
    SessionReleased {
        handle: WorkerHandle,
    },
}

/// Configures and spawns an orchestrator.
pub struct OrchestratorBuilder {
    timings: Timings,
    activity_cap: usize,
    broadcast_capacity: usize,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            timings: Timings::default(),
            activity_cap: DEFAULT_ACTIVITY_CAP,
            broadcast_capacity: 256,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_activity_cap(mut self, cap: usize) -> Self {
        self.activity_cap = cap;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Spawn the actor task and return the handle to it.
    ///
    /// The actor stops when every handle clone is dropped, or on
    /// [`OrchestratorHandle::shutdown`].
    pub fn spawn(self, host: Arc<dyn WorkerHost>) -> OrchestratorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let hub = StatusHub::with_capacity(self.broadcast_capacity);
        let actor = Actor {
            state: RunState::new(self.timings, self.activity_cap),
            host,
            hub: hub.clone(),
            // Spawned dispatch/teardown/advance tasks hold weak senders, so
            // only external handles keep the actor alive.
            tx: tx.downgrade(),
            timings: self.timings,
        };
        tokio::spawn(actor.run(rx));
        OrchestratorHandle { tx, hub }
    }
}

/// Cloneable handle to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorMsg>,
    hub: StatusHub,
}

impl OrchestratorHandle {
    /// Submit a batch of target URLs as a new run.
    ///
    /// Rejected without touching any state while a run is active, while
    /// the orchestrator is disabled, or after it has stopped.
    pub async fn submit_run(
        &self,
        targets: Vec<Url>,
        config: RunConfig,
    ) -> Result<(), SubmitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OrchestratorMsg::SubmitRun {
                targets,
                config,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubmitError::Unavailable)?;
        reply_rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    /// Cancel the active run, if any. Idempotent.
    pub async fn cancel_run(&self) {
        let _ = self.tx.send(OrchestratorMsg::CancelRun).await;
    }

    /// Read-only view of the whole run.
    pub async fn snapshot(&self) -> anyhow::Result<RunView> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(OrchestratorMsg::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| anyhow!("orchestrator is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("orchestrator is not running"))
    }

    /// Subscribe to status updates emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.hub.subscribe()
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let _ = self.tx.send(OrchestratorMsg::SetEnabled(enabled)).await;
    }

    /// Stop the actor. In-flight dispatch tasks abandon themselves.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(OrchestratorMsg::Shutdown).await;
    }

    /// Feed a raw worker signal into the reducer. Fire and forget.
    pub async fn signal(&self, signal: WorkerSignal) {
        if self.tx.send(OrchestratorMsg::Signal(signal)).await.is_err() {
            debug!("worker signal dropped: orchestrator is not running");
        }
    }

    pub async fn report_success(&self, job_id: JobId, report: TaskReport) {
        self.signal(WorkerSignal::Succeeded { job_id, report }).await;
    }

    pub async fn report_failure(&self, job_id: JobId, message: impl Into<String>) {
        self.signal(WorkerSignal::Failed {
            job_id,
            message: message.into(),
        })
        .await;
    }

    pub async fn update_label(&self, handle: WorkerHandle, label: impl Into<String>) {
        self.signal(WorkerSignal::LabelUpdated {
            handle,
            label: label.into(),
        })
        .await;
    }

    pub async fn update_progress(
        &self,
        handle: WorkerHandle,
        current: usize,
        total: usize,
        stage: Option<String>,
    ) {
        self.signal(WorkerSignal::ProgressUpdated {
            handle,
            current,
            total,
            stage,
        })
        .await;
    }

    /// Notice that the host destroyed a session out-of-band.
    pub async fn session_closed(&self, handle: WorkerHandle) {
        self.signal(WorkerSignal::SessionClosed { handle }).await;
    }
}

struct Actor {
    state: RunState,
    host: Arc<dyn WorkerHost>,
    hub: StatusHub,
    tx: mpsc::WeakSender<OrchestratorMsg>,
    timings: Timings,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<OrchestratorMsg>) {
        while let Some(msg) = rx.recv().await {
            if !self.handle(msg) {
                break;
            }
        }
        debug!("orchestrator actor stopped");
    }

    /// Apply one message. Returns false to stop the actor.
    fn handle(&mut self, msg: OrchestratorMsg) -> bool {
        match msg {
            OrchestratorMsg::SubmitRun {
                targets,
                config,
                reply,
            } => match self.state.begin_run(targets, config) {
                Ok(effects) => {
                    let _ = reply.send(Ok(()));
                    self.apply(effects);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            OrchestratorMsg::CancelRun => {
                let effects = self.state.cancel();
                self.apply(effects);
            }
            OrchestratorMsg::Snapshot { reply } => {
                let _ = reply.send(self.state.view());
            }
            OrchestratorMsg::SetEnabled(enabled) => self.state.set_enabled(enabled),
            OrchestratorMsg::Shutdown => return false,
            OrchestratorMsg::Signal(signal) => {
                let effects = self.on_signal(signal);
                self.apply(effects);
            }
            OrchestratorMsg::SessionOpened { job_id, handle } => {
                let effects = self.state.session_opened(job_id, handle);
                self.apply(effects);
            }
            OrchestratorMsg::DispatchFailed { job_id, message } => {
                let effects = self.state.on_failure(job_id, FailureKind::Dispatch, message);
                self.apply(effects);
            }
            OrchestratorMsg::TaskStarted { job_id } => {
                let effects = self.state.task_started(job_id);
                self.apply(effects);
            }
            OrchestratorMsg::ConfirmActive { job_id, reply } => {
                let _ = reply.send(self.state.confirm_active(job_id));
            }
            OrchestratorMsg::Advance => {
                let effects = self.state.advance();
                self.apply(effects);
            }
            OrchestratorMsg::SessionReleased { handle } => self.state.session_released(handle),
        }
        true
    }

    fn on_signal(&mut self, signal: WorkerSignal) -> Vec<RunEffect> {
        match signal {
            WorkerSignal::Succeeded { job_id, report } => self.state.on_success(job_id, report),
            WorkerSignal::Failed { job_id, message } => {
                self.state
                    .on_failure(job_id, FailureKind::WorkerReported, message)
            }
            WorkerSignal::LabelUpdated { handle, label } => self.state.label_updated(handle, label),
            WorkerSignal::ProgressUpdated {
                handle,
                current,
                total,
                stage,
            } => self.state.progress_updated(handle, current, total, stage),
            WorkerSignal::SessionClosed { handle } => self.state.session_closed(handle),
        }
    }

    fn apply(&mut self, effects: Vec<RunEffect>) {
        for effect in effects {
            match effect {
                RunEffect::Publish(update) => self.hub.publish(update),
                RunEffect::Dispatch {
                    job_id,
                    url,
                    config,
                } => {
                    let host = Arc::clone(&self.host);
                    let tx = self.tx.clone();
                    let settle = self.timings.settle;
                    tokio::spawn(dispatcher::dispatch(host, job_id, url, config, settle, tx));
                }
                RunEffect::Teardown { handle, after } => {
                    let host = Arc::clone(&self.host);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        if !after.is_zero() {
                            tokio::time::sleep(after).await;
                        }
                        // Closing an already-gone session is expected.
                        if let Err(err) = host.close_session(handle).await {
                            debug!(%handle, error = %err, "session close failed");
                        }
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(OrchestratorMsg::SessionReleased { handle }).await;
                        }
                    });
                }
                RunEffect::ScheduleAdvance { after } => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(OrchestratorMsg::Advance).await;
                        }
                    });
                }
            }
        }
    }
}
