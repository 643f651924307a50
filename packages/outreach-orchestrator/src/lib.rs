//! Serial job orchestration over isolated worker sessions.
//!
//! Turns a batch of target URLs into jobs, drains them strictly one at a
//! time through an external [`WorkerHost`], folds asynchronous completion
//! and error signals into per-job and per-run state, and broadcasts a
//! status update on every transition.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use outreach_orchestrator::{OrchestratorBuilder, RunConfig, WorkerHost};
//! # async fn example(host: Arc<dyn WorkerHost>) -> anyhow::Result<()> {
//! let orchestrator = OrchestratorBuilder::new().spawn(host);
//! let mut updates = orchestrator.subscribe();
//! orchestrator
//!     .submit_run(
//!         vec!["https://example.com/listing/1".parse()?],
//!         RunConfig::default(),
//!     )
//!     .await?;
//! while let Ok(update) = updates.recv().await {
//!     println!("{}", serde_json::to_string(&update)?);
//!     if update.is_run_complete() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
mod dispatcher;
pub mod error;
pub mod events;
mod orchestrator;
mod run;
pub mod types;
pub mod worker;

pub use broadcast::StatusHub;
pub use config::{DateRange, ProcessingMode, RunConfig, Timings};
pub use error::{FailureKind, JobError, SubmitError};
pub use events::{StatusUpdate, WorkerSignal};
pub use orchestrator::{OrchestratorBuilder, OrchestratorHandle};
pub use types::{
    ActivityEntry, JobId, JobStatus, RunStats, RunSummary, RunView, StatusSnapshot, TaskProgress,
    TaskReport, WorkerHandle,
};
pub use worker::{TaskPayload, WorkerHost};
