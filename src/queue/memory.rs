//! In-process queue with visibility timeouts.

use super::{Delivery, JobQueue};
use crate::error::QueueError;
use crate::models::TelemetryJob;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

struct InFlight {
    job: TelemetryJob,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    ready: VecDeque<TelemetryJob>,
    in_flight: HashMap<String, InFlight>,
    closed: bool,
}

impl State {
    /// Move expired deliveries back to the front of the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(mut flight) = self.in_flight.remove(&receipt) {
                flight.job.attempt_count += 1;
                warn!(
                    event_id = %flight.job.event_id,
                    attempt = flight.job.attempt_count,
                    "Visibility timeout elapsed, redelivering job"
                );
                self.ready.push_front(flight.job);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }
}

/// Bounded queue living inside the gateway process.
///
/// Jobs survive worker crashes and restarts of the worker pool, but not a
/// restart of the process itself.
pub struct MemoryQueue {
    state: Mutex<State>,
    available: Notify,
    capacity: usize,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(capacity: usize, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            capacity,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: TelemetryJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Unavailable("queue is closed".into()));
        }
        if state.ready.len() + state.in_flight.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        debug!(event_id = %job.event_id, "Enqueued job");
        state.ready.push_back(job);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueError::Unavailable("queue is closed".into()));
                }
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some(job) = state.ready.pop_front() {
                    let receipt = Uuid::new_v4().to_string();
                    state.in_flight.insert(
                        receipt.clone(),
                        InFlight {
                            job: job.clone(),
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(Delivery { job, receipt }));
                }

                if now >= give_up {
                    return Ok(None);
                }

                match state.next_deadline() {
                    Some(deadline) if deadline < give_up => deadline,
                    _ => give_up,
                }
            };

            tokio::select! {
                _ = self.available.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.in_flight.remove(receipt) {
            Some(flight) => {
                debug!(event_id = %flight.job.event_id, "Acknowledged job");
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt.to_string())),
        }
    }

    async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.in_flight.len()
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);

        self.available.notify_waiters();
        debug!("Queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::job;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryQueue::new(10, Duration::from_secs(30));
        queue.enqueue(job("a", 1)).await.unwrap();
        queue.enqueue(job("b", 1)).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job.event_id, "a");
        let second = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.job.event_id, "b");

        queue.ack(&first.receipt).await.unwrap();
        queue.ack(&second.receipt).await.unwrap();
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_job_is_not_handed_out_twice() {
        let queue = MemoryQueue::new(10, Duration::from_secs(30));
        queue.enqueue(job("a", 1)).await.unwrap();

        let _delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_visibility_timeout() {
        let queue = MemoryQueue::new(10, Duration::from_secs(30));
        queue.enqueue(job("a", 1)).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job.attempt_count, 1);

        // Never acked: the job comes back once the timeout elapses.
        let second = queue
            .receive(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.job.event_id, "a");
        assert_eq!(second.job.attempt_count, 2);

        assert_eq!(
            queue.ack(&first.receipt).await,
            Err(QueueError::UnknownReceipt(first.receipt.clone()))
        );
        queue.ack(&second.receipt).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let queue = MemoryQueue::new(1, Duration::from_secs(30));
        queue.enqueue(job("a", 1)).await.unwrap();
        assert_eq!(
            queue.enqueue(job("b", 1)).await,
            Err(QueueError::Full { capacity: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_empty() {
        let queue = MemoryQueue::new(1, Duration::from_secs(30));
        assert!(queue
            .receive(Duration::from_millis(500))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_is_unavailable_but_acks() {
        let queue = MemoryQueue::new(10, Duration::from_secs(30));
        queue.enqueue(job("a", 1)).await.unwrap();
        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        queue.close().await;
        assert!(matches!(
            queue.enqueue(job("b", 1)).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(matches!(
            queue.receive(Duration::ZERO).await,
            Err(QueueError::Unavailable(_))
        ));
        queue.ack(&delivery.receipt).await.unwrap();
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(MemoryQueue::new(10, Duration::from_secs(30)));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        queue.close().await;

        let received = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, Err(QueueError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new(10, Duration::from_secs(30)));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job("late", 1)).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job.event_id, "late");
    }
}
