//! Run and timing configuration.
//!
//! `RunConfig` is immutable for the duration of one run and travels to the
//! worker inside the injected task payload. `Timings` isolates the fixed
//! delays the orchestrator uses as readiness proxies; they are heuristics,
//! not true readiness signals, and tests shrink them to milliseconds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend generates responses inside the worker task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Pick replies from a named template bank.
    Template { bank: String },
    /// Generate replies with an AI assistant.
    Assistant {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

impl Default for ProcessingMode {
    fn default() -> Self {
        ProcessingMode::Template {
            bank: "default".to_string(),
        }
    }
}

/// Inclusive date window the worker task uses to filter records.
///
/// The orchestrator forwards this opaquely; filtering happens inside the
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Configuration for one run. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Generate and post replies, not just extract records.
    pub auto_reply: bool,
    /// Tear down each worker session once its job resolves.
    pub auto_close: bool,
    /// How long the worker waits after posting a reply.
    #[serde(with = "duration_ms")]
    pub reply_wait: Duration,
    pub mode: ProcessingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    /// Configured but inert: the drain is strictly serial regardless.
    pub worker_pool_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_reply: false,
            auto_close: true,
            reply_wait: Duration::from_secs(2),
            mode: ProcessingMode::default(),
            date_range: None,
            worker_pool_size: 1,
        }
    }
}

impl RunConfig {
    pub fn with_auto_reply(mut self, auto_reply: bool) -> Self {
        self.auto_reply = auto_reply;
        self
    }

    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }
}

/// Fixed delays between orchestrator steps.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Wait after the session loads before injecting task code, to let
    /// slow third-party pages finish their own load.
    pub settle: Duration,
    /// Grace period before tearing a resolved session down.
    pub teardown_grace: Duration,
    /// Gap between a job resolving and the next dequeue, so teardown can
    /// settle before the next dispatch.
    pub advance_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            teardown_grace: Duration::from_secs(1),
            advance_delay: Duration::from_secs(1),
        }
    }
}

impl Timings {
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn with_advance_delay(mut self, delay: Duration) -> Self {
        self.advance_delay = delay;
        self
    }

    /// Millisecond-scale timings for tests.
    pub fn fast() -> Self {
        Self {
            settle: Duration::from_millis(5),
            teardown_grace: Duration::from_millis(5),
            advance_delay: Duration::from_millis(5),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
