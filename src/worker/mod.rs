//! Analysis worker pool.
//!
//! Each worker takes one job at a time from the queue, runs it through the
//! router (and the consensus checker when required), persists the result
//! and only then acknowledges the delivery. A crash anywhere before the ack
//! means the job is redelivered after its visibility timeout.
//!
//! The pool also runs a retention sweep that drops old completed records
//! and expired idempotency claims.

use crate::config::ConsensusConfig;
use crate::consensus::{apply_verdict, needs_consensus, ConsensusChecker};
use crate::error::{QueueError, StoreError};
use crate::gateway::IdempotencyLedger;
use crate::models::{AnalysisResult, AnalysisStatus};
use crate::notify::NotificationDispatcher;
use crate::queue::{is_poison, Delivery, JobQueue};
use crate::redact::Redactor;
use crate::router::AiRouter;
use crate::store::{EventUpdate, MetadataStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// A result was stored.
    Completed(AnalysisResult),
    /// The event already had a result; the delivery was a duplicate.
    Skipped,
    /// Retried too often; stored as degraded.
    Poisoned,
}

/// Everything a worker needs to process a delivery.
pub struct JobProcessor {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn MetadataStore>,
    pub router: AiRouter,
    pub consensus: Option<ConsensusChecker>,
    pub consensus_config: ConsensusConfig,
    pub redactor: Arc<Redactor>,
    pub dispatcher: NotificationDispatcher,
    pub max_attempts: u32,
}

impl JobProcessor {
    /// Process one delivery. Store failures leave the delivery unacknowledged.
    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, StoreError> {
        let job = &delivery.job;

        if let Some(record) = self.store.get(&job.event_id).await? {
            if record.status == AnalysisStatus::Complete {
                debug!(event_id = %job.event_id, "Duplicate delivery of completed event, skipping");
                self.ack(delivery).await;
                return Ok(ProcessOutcome::Skipped);
            }
        }

        if is_poison(job, self.max_attempts) {
            error!(
                event_id = %job.event_id,
                attempts = job.attempt_count,
                "Job exceeded max attempts, storing degraded result"
            );
            let reason = format!("gave up after {} delivery attempts", job.attempt_count);
            let result = AnalysisResult::degraded(&job.event_id, &reason);
            if let Err(e) = self.store.upsert(job, EventUpdate::Completed(result)).await {
                error!(event_id = %job.event_id, error = %e, "Failed to store degraded result, dropping job");
            }
            self.ack(delivery).await;
            return Ok(ProcessOutcome::Poisoned);
        }

        self.store.upsert(job, EventUpdate::Processing).await?;

        let mut result = self.router.analyze(job).await;

        if let Some(ref checker) = self.consensus {
            if needs_consensus(job, &result, &self.consensus_config) {
                info!(event_id = %job.event_id, voters = checker.voters(), "Escalating to consensus");
                let verdict = checker.verify(job).await;
                result = apply_verdict(result, verdict);
            }
        }

        let result = self.redactor.scrub_analysis(&result);
        self.store
            .upsert(job, EventUpdate::Completed(result.clone()))
            .await?;
        self.ack(delivery).await;

        info!(
            event_id = %job.event_id,
            severity = %result.severity,
            provider = %result.provider_used,
            degraded = result.degraded,
            "Event analyzed"
        );

        self.dispatcher.dispatch(&job.app_id, &result);
        Ok(ProcessOutcome::Completed(result))
    }

    async fn ack(&self, delivery: &Delivery) {
        match self.queue.ack(&delivery.receipt).await {
            Ok(()) => {}
            Err(QueueError::UnknownReceipt(_)) => warn!(
                event_id = %delivery.job.event_id,
                "Receipt expired before ack, a duplicate delivery will be skipped"
            ),
            Err(e) => warn!(event_id = %delivery.job.event_id, error = %e, "Failed to ack job"),
        }
    }
}

/// Periodic cleanup of the metadata store and the idempotency ledger.
pub struct RetentionSweep {
    pub store: Arc<dyn MetadataStore>,
    pub ledger: Arc<IdempotencyLedger>,
    /// Age after which completed records are dropped; `None` keeps them.
    pub retention: Option<Duration>,
    pub interval: Duration,
}

impl RetentionSweep {
    /// One pass. Returns the number of event records and claims removed.
    pub async fn run_once(&self) -> Result<(usize, usize), StoreError> {
        let claims = self.ledger.purge_expired().await;

        let cutoff = self
            .retention
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let events = match cutoff {
            Some(cutoff) => self.store.purge_completed_before(cutoff).await?,
            None => 0,
        };

        Ok((events, claims))
    }
}

/// Supervised set of worker tasks.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

impl WorkerPool {
    /// Spawn `concurrency` workers that run until [`WorkerPool::shutdown`].
    pub fn start(processor: Arc<JobProcessor>, concurrency: usize, poll_interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..concurrency)
            .map(|id| {
                let processor = Arc::clone(&processor);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(id, processor, cancel, poll_interval).await })
            })
            .collect();

        info!("Started {} analysis workers", concurrency);
        Self {
            cancel,
            handles,
            workers: concurrency,
        }
    }

    /// Run `sweep` alongside the workers until shutdown.
    pub fn spawn_sweep(&mut self, sweep: RetentionSweep) {
        let cancel = self.cancel.clone();
        debug!(interval_secs = sweep.interval.as_secs(), "Starting retention sweep");
        self.handles
            .push(tokio::spawn(async move { run_sweep(sweep, cancel).await }));
    }

    /// Number of analysis workers.
    pub fn size(&self) -> usize {
        self.workers
    }

    /// Stop all workers. In-flight jobs are abandoned without an ack.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(id: usize, processor: Arc<JobProcessor>, cancel: CancellationToken, poll_interval: Duration) {
    debug!(worker = id, "Worker started");

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = processor.queue.receive(poll_interval) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker = id, error = %e, "Queue receive failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(
                    worker = id,
                    event_id = %delivery.job.event_id,
                    "Shutdown during analysis, job left for redelivery"
                );
                break;
            }
            outcome = processor.process(&delivery) => {
                if let Err(e) = outcome {
                    error!(
                        worker = id,
                        event_id = %delivery.job.event_id,
                        error = %e,
                        "Failed to persist result, job left for redelivery"
                    );
                }
            }
        }
    }

    debug!(worker = id, "Worker stopped");
}

async fn run_sweep(sweep: RetentionSweep, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(sweep.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match sweep.run_once().await {
            Ok((0, 0)) => debug!("Retention sweep found nothing to remove"),
            Ok((events, claims)) => info!(events, claims, "Retention sweep removed expired entries"),
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RedactionConfig, Tier};
    use crate::models::{SecurityAlert, Severity, TelemetryJob, Verdict, EventBody};
    use crate::notify::tests::RecordingNotifier;
    use crate::queue::MemoryQueue;
    use crate::router::tests::{analysis_json, job, Behavior, MockProvider};
    use crate::router::{CompletionProvider, ProviderRegistry};
    use crate::store::MemoryStore;
    use serde_json::Map;

    struct Harness {
        processor: Arc<JobProcessor>,
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStore>,
        analyst: Arc<MockProvider>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(reply: String, voter_reply: &str, notifier_fails: bool) -> Harness {
        let analyst = MockProvider::new("analyst", Tier::Fast, Behavior::Reply(reply));
        let voters: Vec<Arc<dyn CompletionProvider>> = ["v1", "v2", "v3"]
            .iter()
            .map(|name| {
                MockProvider::new(
                    name,
                    Tier::Smart,
                    Behavior::Reply(format!(r#"{{"verdict":"{}","reason":"r"}}"#, voter_reply)),
                ) as Arc<dyn CompletionProvider>
            })
            .collect();

        let queue = Arc::new(MemoryQueue::new(100, Duration::from_secs(30)));
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier {
            fail: notifier_fails,
            ..Default::default()
        });

        let processor = Arc::new(JobProcessor {
            queue: queue.clone(),
            store: store.clone(),
            router: AiRouter::new(ProviderRegistry::new(vec![analyst.clone() as Arc<dyn CompletionProvider>])),
            consensus: Some(ConsensusChecker::new(voters, &ConsensusConfig::default())),
            consensus_config: ConsensusConfig::default(),
            redactor: Arc::new(Redactor::from_config(&RedactionConfig::default()).unwrap()),
            dispatcher: NotificationDispatcher::new(notifier.clone(), Severity::High, "email"),
            max_attempts: 3,
        });

        Harness {
            processor,
            queue,
            store,
            analyst,
            notifier,
        }
    }

    async fn deliver(h: &Harness, job: TelemetryJob) -> Delivery {
        h.store.upsert(&job, EventUpdate::Queued).await.unwrap();
        h.queue.enqueue(job).await.unwrap();
        h.queue.receive(Duration::ZERO).await.unwrap().unwrap()
    }

    async fn wait_for_alerts(h: &Harness, n: usize) {
        for _ in 0..100 {
            if h.notifier.sent.lock().await.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_process_stores_result_and_acks() {
        let h = harness(analysis_json("medium"), "SAFE", false);
        let delivery = deliver(&h, job(None)).await;

        let outcome = h.processor.process(&delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed(_)));

        let record = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Complete);
        let result = record.result.unwrap();
        assert_eq!(result.provider_used, "analyst");
        assert!(result.consensus_detail.is_none());
        assert_eq!(h.queue.depth().await, 0);
        assert!(h.notifier.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let h = harness(analysis_json("low"), "SAFE", false);
        let delivery = deliver(&h, job(None)).await;
        h.processor.process(&delivery).await.unwrap();

        // Same event delivered again.
        let again = deliver(&h, job(None)).await;
        let outcome = h.processor.process(&again).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert_eq!(h.analyst.calls(), 1);
        assert_eq!(h.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_poison_job_is_degraded_and_acked() {
        let h = harness(analysis_json("low"), "SAFE", false);
        let mut poison = job(None);
        poison.attempt_count = 4;
        let delivery = deliver(&h, poison).await;

        let outcome = h.processor.process(&delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Poisoned);
        assert_eq!(h.analyst.calls(), 0);

        let result = h.store.get("evt-1").await.unwrap().unwrap().result.unwrap();
        assert!(result.degraded);
        assert_eq!(h.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_security_alert_escalates_to_consensus() {
        let h = harness(analysis_json("low"), "ATTACK", false);
        let mut alert = job(None);
        alert.payload.body = EventBody::SecurityAlert(SecurityAlert {
            kind: "path_traversal".into(),
            description: "../../etc/passwd".into(),
            source_ip: None,
            request: None,
            context: Map::new(),
        });
        let delivery = deliver(&h, alert).await;

        let outcome = h.processor.process(&delivery).await.unwrap();
        let ProcessOutcome::Completed(result) = outcome else {
            panic!("expected a stored result");
        };
        let consensus = result.consensus_detail.clone().unwrap();
        assert_eq!(consensus.winning_verdict, Verdict::Attack);
        assert_eq!(consensus.providers_asked, 3);
        assert_eq!(result.severity, Severity::High);

        wait_for_alerts(&h, 1).await;
        assert_eq!(h.notifier.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_leaves_result_intact() {
        let h = harness(analysis_json("critical"), "SAFE", true);
        let delivery = deliver(&h, job(None)).await;

        h.processor.process(&delivery).await.unwrap();
        wait_for_alerts(&h, 1).await;

        let record = h.store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(record.status, AnalysisStatus::Complete);
        assert_eq!(record.result.unwrap().severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_provider_output_is_scrubbed_before_storage() {
        let reply = r#"{"summary":"Login for jane@example.com failed","root_cause":"bad password=hunter2","fix_suggestion":"rotate","severity":"low"}"#;
        let h = harness(reply.to_string(), "SAFE", false);
        let delivery = deliver(&h, job(None)).await;

        h.processor.process(&delivery).await.unwrap();
        let result = h.store.get("evt-1").await.unwrap().unwrap().result.unwrap();
        assert!(!result.summary.contains("jane@example.com"));
        assert!(!result.root_cause.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_poison_job_is_dropped_when_store_is_full() {
        let h = harness(analysis_json("low"), "SAFE", false);
        let full = Arc::new(MemoryStore::with_capacity(1));
        let mut other = job(None);
        other.event_id = "other".to_string();
        full.upsert(&other, EventUpdate::Queued).await.unwrap();

        let processor = JobProcessor {
            queue: h.queue.clone(),
            store: full.clone(),
            router: AiRouter::new(ProviderRegistry::new(vec![h.analyst.clone() as Arc<dyn CompletionProvider>])),
            consensus: None,
            consensus_config: ConsensusConfig::default(),
            redactor: Arc::new(Redactor::from_config(&RedactionConfig::default()).unwrap()),
            dispatcher: NotificationDispatcher::new(h.notifier.clone(), Severity::High, "email"),
            max_attempts: 3,
        };

        let mut poison = job(None);
        poison.attempt_count = 4;
        h.queue.enqueue(poison).await.unwrap();
        let delivery = h.queue.receive(Duration::ZERO).await.unwrap().unwrap();

        let outcome = processor.process(&delivery).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Poisoned);
        assert_eq!(h.queue.depth().await, 0);
        assert!(full.get("evt-1").await.unwrap().is_none());
    }

    fn completed(event_id: &str) -> (TelemetryJob, EventUpdate) {
        let mut j = job(None);
        j.event_id = event_id.to_string();
        let update = EventUpdate::Completed(AnalysisResult::degraded(event_id, "x"));
        (j, update)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_sweep_purges_store_and_ledger() {
        let h = harness(analysis_json("low"), "SAFE", false);
        let ledger = Arc::new(IdempotencyLedger::new(Duration::from_secs(30)));
        ledger.reserve("evt-old", "shop").await;

        let (old, update) = completed("evt-old");
        h.store.upsert(&old, update).await.unwrap();
        let mut pending = job(None);
        pending.event_id = "evt-pending".to_string();
        h.store.upsert(&pending, EventUpdate::Queued).await.unwrap();

        let mut pool = WorkerPool::start(h.processor.clone(), 1, Duration::from_millis(20));
        pool.spawn_sweep(RetentionSweep {
            store: h.store.clone(),
            ledger: ledger.clone(),
            retention: Some(Duration::ZERO),
            interval: Duration::from_secs(60),
        });

        // First tick runs immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.store.get("evt-old").await.unwrap().is_none());
        assert!(h.store.get("evt-pending").await.unwrap().is_some());

        let (late, update) = completed("evt-late");
        h.store.upsert(&late, update).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.store.get("evt-late").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(h.store.get("evt-late").await.unwrap().is_none());
        assert_eq!(ledger.purge_expired().await, 0);
        assert!(ledger.owner("evt-old").await.is_none());

        assert_eq!(pool.size(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_without_retention_keeps_events() {
        let h = harness(analysis_json("low"), "SAFE", false);
        let (old, update) = completed("evt-old");
        h.store.upsert(&old, update).await.unwrap();

        let sweep = RetentionSweep {
            store: h.store.clone(),
            ledger: Arc::new(IdempotencyLedger::new(Duration::from_secs(30))),
            retention: None,
            interval: Duration::from_secs(60),
        };
        assert_eq!(sweep.run_once().await.unwrap(), (0, 0));
        assert!(h.store.get("evt-old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pool_processes_and_shuts_down() {
        let h = harness(analysis_json("medium"), "SAFE", false);
        let pool = WorkerPool::start(h.processor.clone(), 2, Duration::from_millis(20));
        assert_eq!(pool.size(), 2);

        for i in 0..5 {
            let mut j = job(None);
            j.event_id = format!("evt-{}", i);
            h.store.upsert(&j, EventUpdate::Queued).await.unwrap();
            h.queue.enqueue(j).await.unwrap();
        }

        for _ in 0..200 {
            if h.queue.depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        for i in 0..5 {
            let record = h.store.get(&format!("evt-{}", i)).await.unwrap().unwrap();
            assert_eq!(record.status, AnalysisStatus::Complete);
        }
    }
}
