//! API route handlers for the gateway.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use leadflow_core::error::LeadflowError;
use leadflow_core::types::EngagementKind;
use serde::Deserialize;

use crate::events::{ProviderEvent, parse_form};
use crate::server::AppState;

/// 1×1 transparent GIF.
static PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Map an error to a JSON response.
fn error_response(e: LeadflowError) -> Response {
    let status = match &e {
        LeadflowError::NotFound(_) => StatusCode::NOT_FOUND,
        LeadflowError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"ok": false, "error": e.to_string()}))).into_response()
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "leadflow-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "local_tracking_records": state.store.local_count(),
        "deferred_patches": state.store.deferred_count(),
    }))
}

// ---- Engagement tracking ----

/// Open beacon. Always answers with the pixel, whatever happened to the write.
pub async fn open_pixel(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let data = serde_json::json!({ "user_agent": user_agent(&headers) });
    let path = state
        .store
        .record_engagement(&tracking_id, EngagementKind::Open, data)
        .await;
    tracing::debug!("👁️ Open {tracking_id} ({path:?})");
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, private"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Bytes::from_static(&PIXEL_GIF),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: Option<String>,
}

/// Click redirect. Only `http`/`https` destinations are followed.
pub async fn click_redirect(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    Query(query): Query<ClickQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(url) = query.url.map(|u| u.trim().to_string()).filter(|u| is_web_url(u)) else {
        return (StatusCode::BAD_REQUEST, "missing or unsupported url").into_response();
    };
    let Ok(location) = HeaderValue::from_str(&url) else {
        return (StatusCode::BAD_REQUEST, "invalid url").into_response();
    };

    let data = serde_json::json!({ "url": url, "user_agent": user_agent(&headers) });
    let path = state
        .store
        .record_engagement(&tracking_id, EngagementKind::Click, data)
        .await;
    tracing::debug!("🖱️ Click {tracking_id} → {url} ({path:?})");
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn is_web_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["http://", "https://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme) && lower.len() > scheme.len())
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

// ---- Provider webhooks ----
// Always 200: a provider retrying an event we already consumed helps nobody.

/// Voice provider JSON events.
pub async fn voice_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Json<serde_json::Value> {
    let event = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(json) => ProviderEvent::from_json(&json),
        Err(e) => ProviderEvent::Ignored(format!("invalid JSON: {e}")),
    };
    reconcile(&state, event).await
}

/// Carrier call-status form callback.
pub async fn call_status_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let event = ProviderEvent::from_call_status_form(&parse_form(&body));
    reconcile(&state, event).await
}

/// Carrier recording form callback.
pub async fn recording_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let event = ProviderEvent::from_recording_form(&parse_form(&body));
    reconcile(&state, event).await
}

async fn reconcile(state: &AppState, event: ProviderEvent) -> Json<serde_json::Value> {
    let kind = event.kind();
    let outcome = state.reconciler.handle(event).await;
    Json(serde_json::json!({ "ok": true, "event": kind, "outcome": outcome }))
}

// ---- Operator API ----

/// Run one scheduler pass now.
pub async fn scheduler_tick(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let report = state.scheduler.tick().await;
    Json(serde_json::json!({ "ok": !report.overlapped, "report": report }))
}

pub async fn list_failed_enrollments(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.failed_enrollments().await {
        Ok(list) => Json(serde_json::json!({ "ok": true, "count": list.len(), "enrollments": list }))
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn reset_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.reset_enrollment(&id).await {
        Ok(enrollment) => Json(serde_json::json!({ "ok": true, "enrollment": enrollment })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Tracking record with its artifacts and any locally logged engagement.
pub async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
) -> Response {
    let record = match state.store.get(&tracking_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(LeadflowError::NotFound(format!("tracking record {tracking_id}"))),
        Err(e) => return error_response(e),
    };
    let artifacts = match state.store.artifacts(&tracking_id).await {
        Ok(list) => list,
        Err(e) => return error_response(e),
    };
    Json(serde_json::json!({
        "ok": true,
        "record": record,
        "artifacts": artifacts,
        "local_events": {
            "opens": state.store.query_events(EngagementKind::Open, &tracking_id),
            "clicks": state.store.query_events(EngagementKind::Click, &tracking_id),
        },
    }))
    .into_response()
}
