//! Route handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use roomsign_core::PushMessage;
use roomsign_sync::{DispatchReport, PushFrame, Subscription};

use crate::error::{ApiError, ApiResult};
use crate::sse::{self, ChannelSink};
use crate::AppState;

/// Checks `Authorization: Bearer <cron_secret>`.
///
/// Without a configured secret every request is rejected.
fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(secret) = state.cron_secret.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => Ok(()),
        _ => {
            warn!("Rejected request with missing or wrong secret");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}

/// `GET /api/displays/{display_id}/stream`
pub async fn stream_display(
    State(state): State<AppState>,
    Path(display_id): Path<String>,
) -> ApiResult<Response> {
    let display = state
        .db
        .displays()
        .get(&display_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("display {display_id}")))?;

    // Register before reading the snapshot; updates that land meanwhile are
    // held and delivered after init.
    let (sink, rx) = ChannelSink::held(state.sink_buffer);
    let sink = Arc::new(sink);
    let calendar_ids = display.calendar_ids.clone();
    let subscription = Subscription::new(display.id.clone(), display.calendar_ids, sink.clone());
    let subscription_id = state.registry.register(subscription);

    if let Err(e) = send_init(&state, &display.id, display.config, &calendar_ids, &sink).await {
        state.registry.unregister(&subscription_id);
        return Err(e);
    }

    Ok(sse::stream_response(rx, state.registry.clone(), subscription_id).into_response())
}

async fn send_init(
    state: &AppState,
    display_id: &str,
    config: Value,
    calendar_ids: &[String],
    sink: &ChannelSink,
) -> ApiResult<()> {
    let events = state.db.events().list_for_calendars(calendar_ids).await?;
    let init = PushFrame::message(&PushMessage::init(display_id, config, events))?;
    sink.release(&init)
        .map_err(|_| ApiError::Internal("push buffer rejected init frame".into()))
}

/// `POST /api/cron/sync`
pub async fn trigger_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<DispatchReport>> {
    authorize(&state, &headers)?;
    let report = state.dispatcher.dispatch().await?;
    Ok(Json(report))
}

/// `POST /api/displays/{display_id}/config`
pub async fn update_config(
    State(state): State<AppState>,
    Path(display_id): Path<String>,
    headers: HeaderMap,
    Json(config): Json<Value>,
) -> ApiResult<Json<Value>> {
    authorize(&state, &headers)?;
    if !config.is_object() {
        return Err(ApiError::BadRequest("config must be a JSON object".into()));
    }

    state.db.displays().update_config(&display_id, &config).await?;
    let delivered = state.registry.notify_display_config_update(&display_id, &config);
    info!(display_id = %display_id, delivered, "Display config updated");

    Ok(Json(json!({ "delivered": delivered })))
}

/// `GET /api/health/sync`
pub async fn sync_health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let calendars = state.db.calendars().list_sync_states().await?;
    Ok(Json(json!({
        "registry": state.registry.status(),
        "calendars": calendars,
    })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.db.health_check().await {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
