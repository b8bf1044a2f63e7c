//! In-memory metadata store for development and testing.

use super::{apply_update, EventUpdate, MetadataStore};
use crate::error::StoreError;
use crate::models::{AnalysisStatus, EvidenceRecord, EventRecord, TelemetryJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default, Clone)]
pub struct MemoryStore {
    events: Arc<RwLock<HashMap<String, EventRecord>>>,
    evidence: Arc<RwLock<Vec<EvidenceRecord>>>,
    /// Maximum number of event records; 0 is unbounded.
    max_events: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses new event records once `max_events` are held.
    /// Updates to existing records always succeed.
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            max_events,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn upsert(&self, job: &TelemetryJob, update: EventUpdate) -> Result<EventRecord, StoreError> {
        let mut events = self.events.write().await;
        if self.max_events > 0 && events.len() >= self.max_events && !events.contains_key(&job.event_id) {
            return Err(StoreError::Unavailable(format!(
                "event store is full ({} records)",
                self.max_events
            )));
        }
        let existing = events.remove(&job.event_id);
        let record = apply_update(existing, job, update);
        events.insert(record.event_id.clone(), record.clone());

        tracing::debug!(event_id = %record.event_id, status = %record.status, "Upserted event record");
        Ok(record)
    }

    async fn get(&self, event_id: &str) -> Result<Option<EventRecord>, StoreError> {
        let events = self.events.read().await;
        Ok(events.get(event_id).cloned())
    }

    async fn append_evidence(&self, record: EvidenceRecord) -> Result<(), StoreError> {
        let mut evidence = self.evidence.write().await;
        evidence.push(record);
        Ok(())
    }

    async fn evidence_for(&self, app_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        let evidence = self.evidence.read().await;
        Ok(evidence.iter().filter(|r| r.app_id == app_id).cloned().collect())
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, r| r.status != AnalysisStatus::Complete || r.updated_at >= cutoff);
        Ok(before - events.len())
    }
}
