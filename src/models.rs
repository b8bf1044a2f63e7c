//! Data models for the telemetry pipeline.
//!
//! This module contains the core data structures that flow between the
//! redactor, the gateway, the queue, the workers and the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Severity level of an event or an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Analysis could not determine a severity (degraded results)
    Unknown,
    /// Low severity - noise, minor warnings
    Low,
    /// Medium severity - handled errors, degraded features
    Medium,
    /// High severity - crashes, failed requests
    High,
    /// Critical severity - outages, security incidents
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Unknown => write!(f, "unknown"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "unknown" => Ok(Severity::Unknown),
            other => Err(format!("unrecognized severity '{}'", other)),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Unknown => "⚪",
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }
}

/// A crash or uncaught exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A log message captured by the SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReport {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A security signal raised by the SDK's request watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Detector that fired (e.g. "sql_injection", "path_traversal").
    pub kind: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Event payload, one variant per event category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventBody {
    Crash(CrashReport),
    Message(MessageReport),
    SecurityAlert(SecurityAlert),
}

impl EventBody {
    /// Category name as it appears on the wire.
    pub fn category(&self) -> &'static str {
        match self {
            EventBody::Crash(_) => "crash",
            EventBody::Message(_) => "message",
            EventBody::SecurityAlert(_) => "security_alert",
        }
    }

    pub fn is_security_alert(&self) -> bool {
        matches!(self, EventBody::SecurityAlert(_))
    }
}

fn default_environment() -> String {
    "production".to_string()
}

/// An event as captured inside the producing process. Never transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: EventBody,
}

/// An event that went through the redactor.
///
/// The gateway refuses any payload whose `scrubbed` marker is not `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrubbedEvent {
    pub scrubbed: bool,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Unit of work carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryJob {
    /// Idempotency key, unique per event.
    pub event_id: String,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_hint: Option<Severity>,
    pub payload: ScrubbedEvent,
    pub enqueued_at: DateTime<Utc>,
    /// Incremented by the queue on each redelivery.
    pub attempt_count: u32,
}

/// Classification used by the consensus checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Safe,
    Attack,
    Uncertain,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Safe => write!(f, "SAFE"),
            Verdict::Attack => write!(f, "ATTACK"),
            Verdict::Uncertain => write!(f, "UNCERTAIN"),
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SAFE" => Ok(Verdict::Safe),
            "ATTACK" => Ok(Verdict::Attack),
            "UNCERTAIN" => Ok(Verdict::Uncertain),
            other => Err(format!("unrecognized verdict '{}'", other)),
        }
    }
}

/// One provider's answer in a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderVote {
    pub provider: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reason: String,
}

/// Outcome of a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVerdict {
    pub event_id: String,
    pub votes: Vec<ProviderVote>,
    pub winning_verdict: Verdict,
    /// winning votes / votes received; 0 on ties and missing quorum.
    pub confidence: f64,
    /// Number of providers the prompt was sent to.
    pub providers_asked: usize,
}

/// The AI explanation of an event. One authoritative row per event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub event_id: String,
    pub provider_used: String,
    pub summary: String,
    pub root_cause: String,
    pub fix_suggestion: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_detail: Option<ConsensusVerdict>,
    /// True when every provider failed and this is a placeholder.
    #[serde(default)]
    pub degraded: bool,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Placeholder stored when no provider produced a usable answer.
    pub fn degraded(event_id: &str, reason: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            provider_used: "none".to_string(),
            summary: "Automated analysis is currently unavailable for this event.".to_string(),
            root_cause: format!("Analysis could not be completed: {}", reason),
            fix_suggestion: "Inspect the stack trace manually or trigger a re-analysis later."
                .to_string(),
            severity: Severity::Unknown,
            consensus_detail: None,
            degraded: true,
            analyzed_at: Utc::now(),
        }
    }
}

/// Processing status of an event. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Queued,
    Processing,
    Complete,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Queued => write!(f, "queued"),
            AnalysisStatus::Processing => write!(f, "processing"),
            AnalysisStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Metadata store row for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_hint: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ScrubbedEvent>,
    pub status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Synchronous acknowledgment returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub event_id: String,
    pub status: String,
}

impl IngestAck {
    pub fn queued(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            status: "queued".to_string(),
        }
    }
}

/// Append-only compliance record. Never analyzed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: String,
    pub app_id: String,
    pub kind: String,
    pub data: Value,
    pub recorded_at: DateTime<Utc>,
}
