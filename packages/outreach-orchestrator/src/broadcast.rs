//! In-process hub pushing status updates to observers.
//!
//! Failures to reach an observer are non-fatal: a dashboard that lags or
//! disconnects never stalls the run.

use tokio::sync::broadcast;

use crate::events::StatusUpdate;

/// Default buffered updates per subscriber before it starts lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Broadcast hub for [`StatusUpdate`]s.
///
/// Cloneable; all clones share the same channel.
#[derive(Clone)]
pub struct StatusHub {
    sender: broadcast::Sender<StatusUpdate>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Push an update to all subscribers. No-op without subscribers.
    pub fn publish(&self, update: StatusUpdate) {
        // Send errors mean no active receivers; observers are optional.
        let _ = self.sender.send(update);
    }

    /// Subscribe to updates emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusHub")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::types::{JobId, JobStatus, StatusSnapshot};

    fn snapshot(n: u64) -> StatusUpdate {
        StatusUpdate::Snapshot(StatusSnapshot {
            job_id: JobId(n),
            url: Url::parse("https://example.com").unwrap(),
            index: 0,
            status: JobStatus::Queued,
            label: "example.com".into(),
            progress: None,
            stage: None,
            started_at: None,
            ended_at: None,
            error: None,
            completion_rate: None,
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = StatusHub::new();
        hub.publish(snapshot(1));
    }

    #[tokio::test]
    async fn all_subscribers_receive_updates() {
        let hub = StatusHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.publish(snapshot(3));

        let u1 = rx1.recv().await.unwrap();
        let u2 = rx2.recv().await.unwrap();
        assert_eq!(u1.as_snapshot().unwrap().job_id, JobId(3));
        assert_eq!(u2.as_snapshot().unwrap().job_id, JobId(3));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_updates() {
        let hub = StatusHub::new();
        hub.publish(snapshot(1));

        let mut rx = hub.subscribe();
        hub.publish(snapshot(2));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.as_snapshot().unwrap().job_id, JobId(2));
    }
}
