//! Structured error types for every pipeline stage.
//!
//! Only [`GatewayError`] ever reaches a producer; everything raised by the
//! asynchronous stages is absorbed by the router, the worker or the store.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors returned synchronously by the ingestion gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("access denied")]
    Forbidden,

    #[error("event not found: {0}")]
    NotFound(String),

    #[error("quota exceeded, retry after {}s", retry_after.as_secs())]
    QuotaExceeded { retry_after: Duration },

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn validation(field: &str, reason: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::QuotaExceeded { .. } | GatewayError::QueueUnavailable(_)
        )
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "invalid_payload",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden => "access_denied",
            GatewayError::NotFound(_) => "event_not_found",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::QueueUnavailable(_) => "queue_unavailable",
            GatewayError::Store(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Seconds the caller should wait before retrying, for retryable errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            // Round up so a sub-second wait never becomes "retry now".
            GatewayError::QuotaExceeded { retry_after } => {
                Some(retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0))
            }
            GatewayError::QueueUnavailable(_) => Some(QUEUE_RETRY_AFTER_SECS),
            _ => None,
        }
    }

    /// JSON error object shared by single and batch responses.
    pub fn to_json(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if self.is_retryable() {
            error["retryable"] = json!(true);
        }
        if let Some(secs) = self.retry_after_secs() {
            error["retry_after_seconds"] = json!(secs);
        }
        error
    }
}

/// Retry hint for a queue outage; the caller applies its own backoff on top.
const QUEUE_RETRY_AFTER_SECS: u64 = 5;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(json!({ "error": self.to_json() }))).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Failures of a single completion call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("{provider}: timed out after {}ms", timeout.as_millis())]
    Timeout { provider: String, timeout: Duration },

    #[error("{provider}: transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider}: API error {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider}: malformed response: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("{provider}: API key variable {variable} is not set")]
    MissingApiKey { provider: String, variable: String },
}

impl ProviderError {
    pub fn malformed(provider: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RedactError {
    #[error("invalid pattern for rule '{rule}': {reason}")]
    InvalidPattern { rule: String, reason: String },

    #[error("rule table: {0}")]
    RuleTable(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification endpoint returned {0}")]
    Status(u16),
}
