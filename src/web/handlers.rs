//! HTTP request handlers.

use super::AppState;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_db_size_bytes() {
        Ok(size) => Json(json!({
            "status": "ok",
            "targets": state.monitor.targets.len(),
            "alarms": state.monitor.alarms.len(),
            "dbSizeBytes": size,
        }))
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Configuration
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.targets.clone())
}

pub async fn handle_get_definitions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.alarms.clone())
}

// ============================================================================
// API: Metrics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub url_name: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn handle_get_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    let known = query.url_name == state.monitor.canary_name
        || state.monitor.targets.iter().any(|t| t.name == query.url_name);
    if !known {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    // Parse time range
    let end = query
        .end
        .as_deref()
        .and_then(parse_time)
        .unwrap_or_else(Utc::now);

    let start = query
        .start
        .as_deref()
        .and_then(parse_time)
        .unwrap_or_else(|| end - ChronoDuration::hours(1));

    match state.store.get_metric_rows(&query.url_name, start, end) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// API: Alarms
// ============================================================================

pub async fn handle_get_alarms(State(state): State<AppState>) -> impl IntoResponse {
    match state.alarms.list() {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_alarm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.alarms.get(&name) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Alarm not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Accepts a notification batch from an external publisher.
///
/// The body is parsed here rather than by an extractor so malformed payloads
/// still get a `ProcessorResponse`.
pub async fn handle_post_alarm_events(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let payload = String::from_utf8_lossy(&body);
    let response = state.alarms.process_payload(&payload);
    let status = if response.is_success() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(response))
}
