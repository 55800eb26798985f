//! Axum-based HTTP gateway with proper HTTP/1.1 compliance, body limits, and timeouts.
//!
//! - `POST /webhook` feeds one arrival into the ingestor
//! - `GET /health` liveness
//! - `GET /metrics` Prometheus text exposition
//!
//! Every request is bounded by a 64KB body limit and a 30s timeout.

use crate::aggregation::{ArrivalEvent, IngestOutcome, Ingestor};
use crate::idempotency::{GateError, GateOutcome, IdempotencyGate};
use crate::observability::{Metrics, PROMETHEUS_CONTENT_TYPE};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Event sources may set this to collapse their own delivery retries.
pub const INBOUND_IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub metrics: Metrics,
    /// Dedup of redelivered webhook calls, keyed by `X-Idempotency-Key`.
    pub inbound: IdempotencyGate,
}

/// Webhook request body
#[derive(Debug, serde::Deserialize)]
pub struct WebhookBody {
    pub sender_id: String,
    #[serde(default)]
    pub payload_ref: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl WebhookBody {
    fn into_event(self) -> ArrivalEvent {
        let mut event = ArrivalEvent::new(
            self.sender_id.trim(),
            self.payload_ref.trim(),
            self.received_at.unwrap_or_else(Utc::now),
        );
        event.text = self.text.filter(|t| !t.trim().is_empty());
        event.content_type = self.content_type;
        if let Some(channel) = self.channel.filter(|c| !c.trim().is_empty()) {
            event.channel = channel;
        }
        event
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/webhook", post(handle_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn run_gateway(
    host: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!("Gateway listening on http://{host}:{actual_port}");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("Gateway server error")?;
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /metrics: Prometheus text exposition format
async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}

fn outcome_body(outcome: &IngestOutcome) -> serde_json::Value {
    let mut body = serde_json::json!({ "status": outcome.label() });
    match outcome {
        IngestOutcome::Passthrough(batch) | IngestOutcome::Finalized(batch) => {
            body["group_key"] = batch.group_key.as_str().into();
            body["idempotency_key"] = batch.idempotency_key.as_str().into();
            body["item_count"] = batch.item_count.into();
        }
        IngestOutcome::Buffered {
            group_key,
            item_count,
        } => {
            body["group_key"] = group_key.as_str().into();
            body["item_count"] = (*item_count).into();
        }
        IngestOutcome::Dropped { group_key, reason } => {
            body["group_key"] = group_key.as_str().into();
            body["reason"] = reason.to_string().into();
        }
    }
    body
}

/// Store failures still answer 202 so the event source does not storm retries.
fn failed_response() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "failed" })),
    )
}

/// POST /webhook: ingest one arrival
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<WebhookBody>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    // ── Parse body ──
    let Json(webhook_body) = match body {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Webhook JSON parse error: {e}");
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                let err = serde_json::json!({ "error": "Request body too large" });
                return (StatusCode::PAYLOAD_TOO_LARGE, Json(err));
            }
            let err = serde_json::json!({
                "error": "Invalid JSON body. \
                          Expected: {\"sender_id\": \"...\", \"payload_ref\": \"...\"}"
            });
            return (StatusCode::BAD_REQUEST, Json(err));
        }
    };
    if webhook_body.sender_id.trim().is_empty() {
        let err = serde_json::json!({ "error": "sender_id must not be empty" });
        return (StatusCode::BAD_REQUEST, Json(err));
    }
    let event = webhook_body.into_event();

    // ── Idempotency (optional) ──
    let inbound_key = headers
        .get(INBOUND_IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(inbound_key) = inbound_key else {
        return match state.ingestor.ingest(event).await {
            Ok(outcome) => (StatusCode::OK, Json(outcome_body(&outcome))),
            Err(_) => failed_response(),
        };
    };

    let ingestor = state.ingestor.clone();
    match state
        .inbound
        .process_once(inbound_key, || async move { ingestor.ingest(event).await })
        .await
    {
        Ok(GateOutcome::Executed(outcome)) => (StatusCode::OK, Json(outcome_body(&outcome))),
        Ok(GateOutcome::Duplicate) => {
            tracing::info!("Webhook duplicate ignored (idempotency key: {inbound_key})");
            let body = serde_json::json!({
                "status": "duplicate",
                "idempotent": true,
                "message": "Request already processed for this idempotency key"
            });
            (StatusCode::OK, Json(body))
        }
        Err(GateError::Work(_)) => failed_response(),
        Err(GateError::Ledger(e)) => {
            tracing::warn!("Webhook idempotency check failed: {e}");
            let err = serde_json::json!({ "error": e.to_string() });
            (StatusCode::BAD_REQUEST, Json(err))
        }
    }
}
