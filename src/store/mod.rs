//! Metadata store for event records, analysis results and evidence.
//!
//! Every write is an upsert keyed by `event_id`, and a record's status only
//! ever moves forward, so duplicate deliveries and late writers cannot
//! regress or duplicate anything.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::models::{AnalysisResult, AnalysisStatus, EvidenceRecord, EventRecord, TelemetryJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A state change applied to an event record.
#[derive(Debug, Clone)]
pub enum EventUpdate {
    /// Accepted by the gateway.
    Queued,
    /// Picked up by a worker.
    Processing,
    /// Analysis finished (possibly degraded).
    Completed(AnalysisResult),
}

impl EventUpdate {
    pub fn status(&self) -> AnalysisStatus {
        match self {
            EventUpdate::Queued => AnalysisStatus::Queued,
            EventUpdate::Processing => AnalysisStatus::Processing,
            EventUpdate::Completed(_) => AnalysisStatus::Complete,
        }
    }
}

/// Storage contract shared by every backend.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or update the record for `job.event_id`.
    async fn upsert(&self, job: &TelemetryJob, update: EventUpdate) -> Result<EventRecord, StoreError>;

    async fn get(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError>;

    /// Append a compliance record. Records are never updated or removed.
    async fn append_evidence(&self, record: EvidenceRecord) -> Result<(), StoreError>;

    /// Evidence for one application, oldest first.
    async fn evidence_for(&self, app_id: &str) -> Result<Vec<EvidenceRecord>, StoreError>;

    /// Drop completed event records last updated before `cutoff`.
    /// Pending records and evidence are kept. Returns how many were removed.
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Apply `update` to an optional existing record.
///
/// Shared by every backend so the monotonic-status rule lives in one place.
pub fn apply_update(existing: Option<EventRecord>, job: &TelemetryJob, update: EventUpdate) -> EventRecord {
    let now = Utc::now();
    let mut record = existing.unwrap_or_else(|| EventRecord {
        event_id: job.event_id.clone(),
        app_id: job.app_id.clone(),
        severity_hint: job.severity_hint,
        payload: Some(job.payload.clone()),
        status: AnalysisStatus::Queued,
        result: None,
        received_at: job.enqueued_at,
        updated_at: now,
    });

    record.status = record.status.max(update.status());
    if let EventUpdate::Completed(result) = update {
        record.result = Some(result);
    }
    record.updated_at = now;
    record
}
