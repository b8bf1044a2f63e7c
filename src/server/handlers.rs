//! Request handlers. Each one is a thin adapter over a [`Gateway`] call.

use crate::error::GatewayError;
use crate::gateway::{AnalysisView, Gateway, ReanalyzeOutcome};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "pong" }))
}

pub async fn health(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Result<Response, GatewayError> {
    let info = gateway.health(credential(&headers)).await?;
    Ok(Json(info).into_response())
}

pub async fn ingest(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let ack = gateway.accept(credential(&headers), &body).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

pub async fn ingest_batch(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let ack = gateway.accept_batch(credential(&headers), &body).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

pub async fn analysis(
    State(gateway): State<Arc<Gateway>>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    match gateway.analysis(credential(&headers), &event_id).await? {
        AnalysisView::Complete(result) => Ok(Json(result).into_response()),
        AnalysisView::Pending { event_id, status } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "event_id": event_id, "status": status })),
        )
            .into_response()),
    }
}

pub async fn analyze(
    State(gateway): State<Arc<Gateway>>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let response = match gateway.reanalyze(credential(&headers), &event_id).await? {
        ReanalyzeOutcome::AlreadyAnalyzed => (
            StatusCode::OK,
            Json(json!({ "event_id": event_id, "status": "already_analyzed" })),
        ),
        ReanalyzeOutcome::Queued => (
            StatusCode::ACCEPTED,
            Json(json!({ "event_id": event_id, "status": "queued" })),
        ),
    };
    Ok(response.into_response())
}

pub async fn evidence(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let record = gateway.log_evidence(credential(&headers), &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": record.id, "status": "logged" })),
    )
        .into_response())
}
