//! Boundary to the host environment that owns worker sessions.
//!
//! A worker session is an isolated execution context (a browser tab, in the
//! reference host) that loads a target URL and runs injected task code. The
//! orchestrator never looks inside a session; it only holds a handle.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::config::RunConfig;
use crate::types::{JobId, WorkerHandle};

/// Payload injected into a worker session at dispatch time.
///
/// The worker reports results back keyed by `job_id`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub job_id: JobId,
    pub config: RunConfig,
}

/// Host environment capable of creating and destroying worker sessions.
///
/// Implementations are external to this crate (a browser driver in
/// production, a mock in tests). All methods may be called concurrently
/// with each other but never twice for the same step of the same job.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    /// Create a session loaded at `url` and return its opaque handle.
    async fn create_session(&self, url: &Url) -> Result<WorkerHandle>;

    /// Inject the scraping/reply capability into the session.
    async fn inject_runner(&self, handle: WorkerHandle) -> Result<()>;

    /// Hand the session its configuration and trigger the task entry point.
    async fn start_task(&self, handle: WorkerHandle, payload: TaskPayload) -> Result<()>;

    /// Destroy the session. Failing to close an already-gone session is
    /// expected and callers swallow the error.
    async fn close_session(&self, handle: WorkerHandle) -> Result<()>;
}
