//! Authenticated webhook receiver: accepts manager event pushes, schedules
//! or triggers reconciliation, and serves `/health` and `/metrics`.
//!
//! Built on `axum` + `tower`, grounded on the `radarr-mvp` reference
//! manifest in the corpus (the one Rust media-manager-adjacent service that
//! pairs `axum`/`tower`/`tokio`/`reqwest`) since the chosen teacher has no
//! HTTP server crate of its own. Auth and rate-limiting are composed as
//! ordinary handler-entry checks rather than `tower::Layer`s, mirroring how
//! the teacher composes `RateLimiter`/`RetryPolicy` as explicit
//! constructor-supplied collaborators instead of framework middleware.

pub mod auth;
pub mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::cache::TtlCache;
use crate::engine::ReconciliationEngine;
use crate::manager::ManagerClient;
use crate::metrics::Metrics;
use crate::scheduler::{DelayedTaskScheduler, Fingerprint, Trigger};
use rate_limit::RateLimiter;

const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Long-lived state shared across webhook handlers, constructed once at
/// startup and handed to axum as `State`.
pub struct WebhookState {
    pub client: ManagerClient,
    pub engine: ReconciliationEngine,
    pub scheduler: Arc<DelayedTaskScheduler>,
    pub metrics: Arc<Metrics>,
    pub secret: Option<String>,
    pub rate_limiter: RateLimiter,
    pub dedup: TtlCache<()>,
    pub import_check_delay: Duration,
    pub started_at: StdInstant,
    pub version: &'static str,
}

/// Builds the axum router for the webhook receiver plus health/metrics.
#[must_use]
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/sonarr", post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Loosely-typed inbound event body. Unknown `eventType` values and missing
/// optional fields are tolerated (spec.md §4.5 "other" row); only
/// `event_type` is required to route the request at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    event_type: String,
    #[serde(default)]
    episode: Option<EpisodeRef>,
    #[serde(default, rename = "download_id", alias = "downloadId")]
    download_id: Option<String>,
    /// Best-effort delivery identifier used only for dedup; the manager
    /// does not guarantee one on every event type.
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EpisodeRef {
    id: i64,
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    uptime_seconds: u64,
    cache: CacheSummary,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    size: u64,
    active: u64,
    expired: u64,
}

#[instrument(skip(state, headers, body))]
async fn webhook_handler(
    State(state): State<Arc<WebhookState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !state.rate_limiter.admit(&addr.ip().to_string()) {
        state.metrics.webhook_rate_limited.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "rate limited"}))).into_response();
    }

    let shared_secret_header = headers.get("X-Webhook-Secret").and_then(|v| v.to_str().ok());
    let signature_header = headers.get("X-Webhook-Signature").and_then(|v| v.to_str().ok());
    if !auth::is_authenticated(state.secret.as_deref(), shared_secret_header, signature_header, &body) {
        state.metrics.webhook_auth_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "malformed webhook body");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed body"}))).into_response();
        }
    };

    let dedup_key = format!(
        "{}:{}:{}",
        payload.event_type,
        payload.download_id.as_deref().unwrap_or(""),
        payload.event_id.as_deref().unwrap_or("")
    );
    if state.dedup.contains(&dedup_key) {
        info!(event_type = %payload.event_type, "duplicate webhook delivery collapsed");
        return (StatusCode::OK, Json(Ack { status: "duplicate" })).into_response();
    }
    state.dedup.put(dedup_key, (), DEDUP_WINDOW);

    state.metrics.record_webhook_event(&payload.event_type);

    match dispatch(&state, &payload).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            warn!(error = %err, "webhook processing error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Routes a validated, deduped payload per spec.md §4.5's event table.
async fn dispatch(
    state: &WebhookState,
    payload: &WebhookPayload,
) -> Result<(StatusCode, Json<Ack>), WebhookError> {
    match payload.event_type.as_str() {
        "Test" => Ok((StatusCode::OK, Json(Ack { status: "ok" }))),

        "Grab" => {
            let (Some(episode), Some(download_id)) = (&payload.episode, payload.download_id.as_deref())
            else {
                return Err(WebhookError::MissingField("episode.id and download_id required for Grab"));
            };
            let fingerprint = Fingerprint::new(episode.id, download_id.to_string());
            let due_at = Instant::now() + state.import_check_delay;
            state.scheduler.schedule(fingerprint, due_at, Trigger::PostGrabCheck).await;
            Ok((StatusCode::OK, Json(Ack { status: "scheduled" })))
        }

        "Download" | "Import" => {
            if let (Some(episode), Some(download_id)) = (&payload.episode, payload.download_id.as_deref()) {
                let fingerprint = Fingerprint::new(episode.id, download_id.to_string());
                state.scheduler.cancel(&fingerprint).await;
                state.client.cache().invalidate(&format!("history/episode/{}", episode.id));
                state.client.cache().invalidate(&format!("episode_file/{}", episode.id));
            }
            Ok((StatusCode::OK, Json(Ack { status: "acknowledged" })))
        }

        "ImportFailure" | "DownloadFailure" => {
            let Some(episode) = &payload.episode else {
                return Err(WebhookError::MissingField("episode.id required for failure events"));
            };
            trigger_immediate_reconcile(state, episode.id, payload.download_id.as_deref()).await?;
            Ok((StatusCode::OK, Json(Ack { status: "reconciling" })))
        }

        "HealthIssue" => {
            warn!("manager reported a health issue");
            Ok((StatusCode::OK, Json(Ack { status: "logged" })))
        }

        _ => Ok((StatusCode::OK, Json(Ack { status: "ignored" }))),
    }
}

/// Fetches the current queue and reconciles the item matching `episode_id`
/// (and `download_id` when supplied), per spec.md §4.5's `ImportFailure`/
/// `DownloadFailure` row.
async fn trigger_immediate_reconcile(
    state: &WebhookState,
    episode_id: i64,
    download_id: Option<&str>,
) -> Result<(), WebhookError> {
    let queue = state.client.fetch_queue().await.map_err(|err| WebhookError::Upstream(err.to_string()))?;
    let Some(item) = queue.iter().find(|item| {
        item.episode_id == episode_id && download_id.is_none_or(|id| item.download_id == id)
    }) else {
        info!(episode_id, "failure event referenced an item no longer in the queue");
        return Ok(());
    };

    state
        .engine
        .reconcile(item)
        .await
        .map_err(|err| WebhookError::Upstream(err.to_string()))?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<WebhookState>>) -> impl IntoResponse {
    let stats = state.client.cache().stats();
    Json(HealthBody {
        status: "ok",
        service: "reconciler",
        version: state.version,
        timestamp: chrono::Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        cache: CacheSummary { size: stats.size, active: stats.active, expired: stats.expired },
    })
}

async fn metrics_handler(State(state): State<Arc<WebhookState>>) -> impl IntoResponse {
    let mut snapshot = state.metrics.snapshot();
    snapshot.manager_api_calls = state.client.call_count();
    Json(snapshot)
}

/// Errors raised while dispatching a validated webhook event. Never
/// surfaced verbatim to the caller (spec.md §7 "never leaks internal error
/// text") — the handler coerces every variant to a bare 500.
#[derive(Debug, thiserror::Error)]
enum WebhookError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("upstream manager error: {0}")]
    Upstream(String),
}
