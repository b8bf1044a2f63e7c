//! Durable job queue between the gateway and the worker pool.
//!
//! Delivery is at-least-once: a received job stays invisible to other
//! consumers until it is acknowledged or its visibility timeout elapses,
//! after which it is handed out again with `attempt_count` incremented.

mod memory;

pub use memory::MemoryQueue;

use crate::error::QueueError;
use crate::models::TelemetryJob;
use async_trait::async_trait;
use std::time::Duration;

/// A job handed to one consumer, plus the receipt needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: TelemetryJob,
    pub receipt: String,
}

/// Queue contract shared by every backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Fails with [`QueueError::Full`] when the queue is at capacity.
    async fn enqueue(&self, job: TelemetryJob) -> Result<(), QueueError>;

    /// Wait up to `wait` for a job. `Ok(None)` means nothing became available.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;

    /// Number of jobs waiting or in flight.
    async fn depth(&self) -> usize;

    /// Stop handing out and accepting jobs. Outstanding deliveries can still
    /// be acknowledged; later calls to `enqueue` and `receive` fail with
    /// [`QueueError::Unavailable`].
    async fn close(&self) {}
}

/// Whether a delivery has been retried too often to process again.
pub fn is_poison(job: &TelemetryJob, max_attempts: u32) -> bool {
    max_attempts > 0 && job.attempt_count > max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventBody, MessageReport, ScrubbedEvent};
    use chrono::Utc;

    pub(crate) fn job(event_id: &str, attempt_count: u32) -> TelemetryJob {
        TelemetryJob {
            event_id: event_id.to_string(),
            app_id: "app".to_string(),
            severity_hint: None,
            payload: ScrubbedEvent {
                scrubbed: true,
                environment: "test".to_string(),
                source: None,
                occurred_at: None,
                body: EventBody::Message(MessageReport {
                    level: "error".to_string(),
                    message: "boom".to_string(),
                    context: Default::default(),
                }),
            },
            enqueued_at: Utc::now(),
            attempt_count,
        }
    }

    #[test]
    fn test_is_poison() {
        assert!(!is_poison(&job("a", 1), 5));
        assert!(!is_poison(&job("a", 5), 5));
        assert!(is_poison(&job("a", 6), 5));
    }

    #[test]
    fn test_is_poison_zero_max_is_unlimited() {
        assert!(!is_poison(&job("a", 100), 0));
    }
}
