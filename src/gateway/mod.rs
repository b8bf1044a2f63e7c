//! Ingestion gateway.
//!
//! The only synchronous surface of the pipeline. It authenticates the
//! producer, validates and re-scrubs the payload, applies the per-app quota
//! and idempotency rules, and hands the event to the queue. Analysis happens
//! later and never blocks an ingest call.

mod auth;
mod idempotency;
mod quota;

pub use auth::{AppIdentity, CredentialStore};
pub use idempotency::IdempotencyLedger;
use idempotency::Reservation;
use quota::QuotaGuard;

use crate::error::GatewayError;
use crate::models::{
    AnalysisResult, AnalysisStatus, EventRecord, EvidenceRecord, IngestAck, ScrubbedEvent, Severity, TelemetryJob,
};
use crate::queue::JobQueue;
use crate::redact::Redactor;
use crate::store::{EventUpdate, MetadataStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest accepted event id.
pub const MAX_EVENT_ID_LEN: usize = 128;

/// Most events accepted in one batch call.
pub const MAX_BATCH_EVENTS: usize = 100;

/// Evidence kinds accepted by [`Gateway::log_evidence`].
pub const EVIDENCE_TYPES: &[&str] = &[
    "AUDIT_DEPLOY",
    "AUDIT_SCAN",
    "AUDIT_ACCESS",
    "AUDIT_CONFIG",
    "AUDIT_EXPORT",
    "AUDIT_INCIDENT",
];

/// Body of `POST /v1/telemetry`.
#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    #[serde(default)]
    pub app_credential: Option<String>,
    /// Generated by the gateway when absent.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub severity_hint: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Body of `POST /v1/telemetry/batch`.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub app_credential: Option<String>,
    /// Raw events, parsed one by one so a malformed entry only fails itself.
    #[serde(default)]
    pub events: Vec<Value>,
}

/// Per-event outcome of a batch call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Response of `POST /v1/telemetry/batch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchAck {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<BatchItem>,
}

/// Body of `POST /v1/evidence`.
#[derive(Debug, Deserialize)]
pub struct EvidenceRequest {
    #[serde(default)]
    pub app_credential: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Response of `GET /v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub status: &'static str,
    pub app: AppIdentity,
    pub queue_depth: usize,
}

/// What `GET /v1/events/{id}/analysis` found.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisView {
    Pending { event_id: String, status: AnalysisStatus },
    Complete(AnalysisResult),
}

/// What `POST /v1/events/{id}/analyze` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReanalyzeOutcome {
    AlreadyAnalyzed,
    Queued,
}

struct Validated {
    event_id: String,
    severity_hint: Option<Severity>,
    payload: ScrubbedEvent,
}

fn validate(request: TelemetryRequest) -> Result<Validated, GatewayError> {
    let payload = request
        .payload
        .ok_or_else(|| GatewayError::validation("payload", "missing"))?;

    match payload.get("scrubbed") {
        Some(Value::Bool(true)) => {}
        Some(_) => return Err(GatewayError::validation("payload.scrubbed", "must be true")),
        None => return Err(GatewayError::validation("payload.scrubbed", "missing")),
    }

    let event_id = match request.event_id {
        Some(id) => {
            let id = id.trim().to_string();
            if id.is_empty() {
                return Err(GatewayError::validation("event_id", "must not be empty"));
            }
            if id.len() > MAX_EVENT_ID_LEN {
                return Err(GatewayError::validation("event_id", "longer than 128 characters"));
            }
            id
        }
        None => Uuid::new_v4().to_string(),
    };

    let severity_hint = request
        .severity_hint
        .map(|s| s.parse::<Severity>())
        .transpose()
        .map_err(|e| GatewayError::validation("severity_hint", &e))?;

    let payload: ScrubbedEvent = serde_json::from_value(payload)
        .map_err(|e| GatewayError::validation("payload", &e.to_string()))?;

    Ok(Validated {
        event_id,
        severity_hint,
        payload,
    })
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::validation("body", &e.to_string()))
}

/// The ingestion gateway. Cheap to share behind an `Arc`.
pub struct Gateway {
    credentials: CredentialStore,
    quota: QuotaGuard,
    ledger: Arc<IdempotencyLedger>,
    redactor: Arc<Redactor>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MetadataStore>,
}

impl Gateway {
    pub fn new(
        credentials: CredentialStore,
        ledger: Arc<IdempotencyLedger>,
        redactor: Arc<Redactor>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let quota = QuotaGuard::new(credentials.limits());
        Self {
            credentials,
            quota,
            ledger,
            redactor,
            queue,
            store,
        }
    }

    /// Accept one telemetry event.
    ///
    /// `header_credential` is the `Authorization` header value; a credential
    /// inside the body takes precedence.
    pub async fn accept(&self, header_credential: Option<&str>, body: &[u8]) -> Result<IngestAck, GatewayError> {
        let mut request: TelemetryRequest = parse_body(body)?;
        let credential = request.app_credential.take();
        let app = self
            .credentials
            .authenticate(credential.as_deref().or(header_credential))?;

        self.ingest(&app, request).await
    }

    /// Accept several events in one call.
    ///
    /// Authentication and the envelope are checked once; every event is then
    /// accepted or rejected on its own.
    pub async fn accept_batch(&self, header_credential: Option<&str>, body: &[u8]) -> Result<BatchAck, GatewayError> {
        let request: BatchRequest = parse_body(body)?;
        let app = self
            .credentials
            .authenticate(request.app_credential.as_deref().or(header_credential))?;

        if request.events.is_empty() {
            return Err(GatewayError::validation("events", "must not be empty"));
        }
        if request.events.len() > MAX_BATCH_EVENTS {
            return Err(GatewayError::validation(
                "events",
                &format!("at most {} events per batch", MAX_BATCH_EVENTS),
            ));
        }

        let mut results = Vec::with_capacity(request.events.len());
        for (index, event) in request.events.into_iter().enumerate() {
            let outcome = match serde_json::from_value::<TelemetryRequest>(event) {
                Ok(event) => self.ingest(&app, event).await,
                Err(e) => Err(GatewayError::validation("event", &e.to_string())),
            };
            results.push(match outcome {
                Ok(ack) => BatchItem {
                    index,
                    event_id: Some(ack.event_id),
                    status: "queued",
                    error: None,
                },
                Err(e) => {
                    debug!(app_id = %app.app_id, index, error = %e, "Batch event rejected");
                    BatchItem {
                        index,
                        event_id: None,
                        status: "rejected",
                        error: Some(e.to_json()),
                    }
                }
            });
        }

        let accepted = results.iter().filter(|r| r.error.is_none()).count();
        let rejected = results.len() - accepted;
        info!(app_id = %app.app_id, accepted, rejected, "Batch processed");
        Ok(BatchAck {
            accepted,
            rejected,
            results,
        })
    }

    async fn ingest(&self, app: &AppIdentity, request: TelemetryRequest) -> Result<IngestAck, GatewayError> {
        let validated = validate(request)?;
        let event_id = validated.event_id.clone();

        if let Some(owner) = self.ledger.owner(&event_id).await {
            if owner != app.app_id {
                return Err(GatewayError::validation("event_id", "already in use"));
            }
            debug!(event_id = %event_id, "Duplicate submission within retention window");
            return Ok(IngestAck::queued(&event_id));
        }
        if let Some(existing) = self.store.get(&event_id).await? {
            if existing.app_id != app.app_id {
                return Err(GatewayError::validation("event_id", "already in use"));
            }
            debug!(event_id = %event_id, "Event already stored, not re-enqueuing");
            return Ok(IngestAck::queued(&event_id));
        }

        self.quota.check(&app.app_id)?;

        match self.ledger.reserve(&event_id, &app.app_id).await {
            Reservation::Reserved => {}
            Reservation::Held(owner) if owner != app.app_id => {
                return Err(GatewayError::validation("event_id", "already in use"));
            }
            Reservation::Held(_) => return Ok(IngestAck::queued(&event_id)),
        }

        let payload = self.redactor.reapply(&validated.payload);
        if payload != validated.payload {
            let raw = serde_json::to_string(&validated.payload).unwrap_or_default();
            warn!(
                event_id = %event_id,
                app_id = %app.app_id,
                rules = ?self.redactor.find_matches(&raw),
                "Payload still contained sensitive data after client-side scrubbing"
            );
        }

        let job = TelemetryJob {
            event_id: event_id.clone(),
            app_id: app.app_id.clone(),
            severity_hint: validated.severity_hint,
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 1,
        };

        // Enqueue first: a failed enqueue must leave no record behind.
        if let Err(e) = self.queue.enqueue(job.clone()).await {
            self.ledger.release(&event_id).await;
            warn!(event_id = %event_id, error = %e, "Enqueue failed");
            return Err(GatewayError::QueueUnavailable(e.to_string()));
        }

        // The worker creates the record itself if this write is lost.
        if let Err(e) = self.store.upsert(&job, EventUpdate::Queued).await {
            warn!(event_id = %event_id, error = %e, "Failed to record queued event");
        }

        info!(
            event_id = %event_id,
            app_id = %app.app_id,
            category = validated.payload.body.category(),
            "Event accepted"
        );
        Ok(IngestAck::queued(&event_id))
    }

    /// Authenticated health check.
    pub async fn health(&self, credential: Option<&str>) -> Result<HealthInfo, GatewayError> {
        let app = self.credentials.authenticate(credential)?;
        Ok(HealthInfo {
            status: "healthy",
            app,
            queue_depth: self.queue.depth().await,
        })
    }

    async fn owned_record(&self, app: &AppIdentity, event_id: &str) -> Result<EventRecord, GatewayError> {
        let record = self
            .store
            .get(event_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(event_id.to_string()))?;

        if record.app_id != app.app_id {
            return Err(GatewayError::Forbidden);
        }
        Ok(record)
    }

    /// Status or result of one event.
    pub async fn analysis(&self, credential: Option<&str>, event_id: &str) -> Result<AnalysisView, GatewayError> {
        let app = self.credentials.authenticate(credential)?;
        let record = self.owned_record(&app, event_id).await?;

        match (record.status, record.result) {
            (AnalysisStatus::Complete, Some(result)) => Ok(AnalysisView::Complete(result)),
            (status, _) => Ok(AnalysisView::Pending {
                event_id: record.event_id,
                status,
            }),
        }
    }

    /// Queue a stored event for analysis again.
    pub async fn reanalyze(&self, credential: Option<&str>, event_id: &str) -> Result<ReanalyzeOutcome, GatewayError> {
        let app = self.credentials.authenticate(credential)?;
        let record = self.owned_record(&app, event_id).await?;

        if record.status == AnalysisStatus::Complete {
            return Ok(ReanalyzeOutcome::AlreadyAnalyzed);
        }

        let payload = record
            .payload
            .ok_or_else(|| GatewayError::NotFound(event_id.to_string()))?;

        let job = TelemetryJob {
            event_id: record.event_id.clone(),
            app_id: record.app_id.clone(),
            severity_hint: record.severity_hint,
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 1,
        };
        self.queue
            .enqueue(job)
            .await
            .map_err(|e| GatewayError::QueueUnavailable(e.to_string()))?;

        info!(event_id = %event_id, app_id = %app.app_id, "Event re-queued for analysis");
        Ok(ReanalyzeOutcome::Queued)
    }

    /// Append a compliance record. Evidence is never analyzed.
    pub async fn log_evidence(&self, header_credential: Option<&str>, body: &[u8]) -> Result<EvidenceRecord, GatewayError> {
        let mut request: EvidenceRequest = parse_body(body)?;
        let credential = request.app_credential.take();
        let app = self
            .credentials
            .authenticate(credential.as_deref().or(header_credential))?;

        let kind = request.kind.trim().to_uppercase();
        if !EVIDENCE_TYPES.contains(&kind.as_str()) {
            return Err(GatewayError::validation(
                "type",
                &format!("must be one of {}", EVIDENCE_TYPES.join(", ")),
            ));
        }

        let record = EvidenceRecord {
            id: Uuid::new_v4().to_string(),
            app_id: app.app_id.clone(),
            kind,
            data: self.redactor.scrub_structured(&request.data),
            recorded_at: request.timestamp.unwrap_or_else(Utc::now),
        };
        self.store.append_evidence(record.clone()).await?;

        info!(id = %record.id, app_id = %app.app_id, kind = %record.kind, "Evidence logged");
        Ok(record)
    }
}
