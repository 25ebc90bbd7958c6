//! HTTP surface: push-notification ingest, action endpoint, Telegram
//! webhook, watch renewal, health.
//!
//! Notification-driven paths acknowledge with an empty 204 whatever the
//! pipeline outcome; only unparsable input gets a 400.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::channels::telegram::TelegramUpdate;
use crate::pipeline::{ApprovalRequest, CoiAction, Pipeline, decode_envelope};

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

/// Build the service router.
pub fn app_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/coi", post(coi_action))
        .route("/telegram", post(telegram_webhook))
        .route("/watch/renew", post(renew_watch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "coi-assist"
    }))
}

// ── Ingest ──────────────────────────────────────────────────────────────

async fn ingest(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let notification = match decode_envelope(&body) {
        Ok(Some(notification)) => notification,
        Ok(None) => {
            debug!("Push envelope without data");
            return StatusCode::NO_CONTENT;
        }
        Err(e) => {
            warn!(error = %e, "Rejecting malformed push envelope");
            return StatusCode::BAD_REQUEST;
        }
    };

    let outcome = state.pipeline.ingest.handle(&notification).await;
    info!(outcome = ?outcome, history_id = ?notification.history_id, "Notification handled");
    StatusCode::NO_CONTENT
}

// ── Actions ─────────────────────────────────────────────────────────────

async fn coi_action(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let action: CoiAction = match serde_json::from_slice(&body) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "Rejecting unknown or malformed action");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = state.pipeline.service.handle(action).await {
        error!(error = %e, "Action failed");
    }
    StatusCode::NO_CONTENT
}

// ── Telegram ────────────────────────────────────────────────────────────

/// Carries either a Telegram update with a button press, or an approval
/// notification payload to open.
async fn telegram_webhook(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed Telegram payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    if value.get("callback_query").is_some() {
        let update: TelegramUpdate = match serde_json::from_value(value) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed callback query");
                return StatusCode::BAD_REQUEST;
            }
        };
        if let Some(callback) = update.callback_query {
            match state.pipeline.gate.handle_callback(&callback).await {
                Ok(outcome) => info!(outcome = ?outcome, "Callback handled"),
                Err(e) => error!(error = %e, "Callback handling failed"),
            }
        }
        return StatusCode::NO_CONTENT;
    }

    if value.get("thread_id").is_some() {
        let request: ApprovalRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed approval notification");
                return StatusCode::BAD_REQUEST;
            }
        };
        match state.pipeline.gate.open(request).await {
            Ok(outcome) => info!(outcome = ?outcome, "Approval notification handled"),
            Err(e) => error!(error = %e, "Approval notification failed"),
        }
        return StatusCode::NO_CONTENT;
    }

    debug!("Telegram payload without callback or thread id");
    StatusCode::BAD_REQUEST
}

// ── Watch renewal ───────────────────────────────────────────────────────

async fn renew_watch(State(state): State<AppState>) -> Response {
    let Some(renewer) = state.pipeline.watch.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Watch renewal is not configured"})),
        )
            .into_response();
    };

    match renewer.renew().await {
        Ok(registration) => Json(serde_json::json!({
            "history_id": registration.history_id,
            "expiration": registration.expiration,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Watch renewal failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
