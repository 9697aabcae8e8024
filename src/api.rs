// src/api.rs
//! Operator HTTP surface over a [`DashboardCore`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::consolidate::RefreshOptions;
use crate::error::ConsolidationError;
use crate::service::{CacheInvalidation, DashboardCore};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<DashboardCore>,
}

impl AppState {
    pub fn new(core: Arc<DashboardCore>) -> Self {
        Self { core }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/snapshot", get(snapshot))
        .route("/snapshot/areas/{area}", get(snapshot_area))
        .route("/status", get(status))
        .route("/sources", get(sources))
        .route("/performance", get(performance))
        .route("/alerts", get(alerts))
        .route("/rate-limit/{source}", get(rate_limit))
        .route("/refresh", post(refresh))
        .route("/refresh/areas/{area}", post(refresh_area))
        .route("/events/focus", post(on_focus))
        .route("/events/reconnect", post(on_reconnect))
        .route("/admin/sources/{source}/enable", post(enable_source))
        .route("/admin/sources/{source}/disable", post(disable_source))
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .route("/admin/cache/clear", post(clear_cache))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// JSON error body: `{"error": "..."}`.
struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, what.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "request failed");
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.snapshot().as_ref().clone())
}

async fn snapshot_area(
    State(state): State<AppState>,
    Path(area): Path<String>,
) -> Result<Response, ApiError> {
    let snap = state.core.snapshot();
    match snap.area(&area) {
        Some(a) => Ok(Json(a).into_response()),
        None => Err(ApiError::not_found(format!("unknown area: {area}"))),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.refresh_status())
}

async fn sources(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.source_health())
}

#[derive(Deserialize)]
struct PerformanceQuery {
    source: Option<String>,
}

async fn performance(
    State(state): State<AppState>,
    Query(q): Query<PerformanceQuery>,
) -> impl IntoResponse {
    match q.source {
        Some(source) => Json(json!(state.core.performance_summary(Some(&source)))),
        None => Json(json!({
            "overall": state.core.performance_summary(None),
            "sources": state.core.performance_summaries(),
        })),
    }
}

#[derive(Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    active: bool,
}

async fn alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertsQuery>,
) -> impl IntoResponse {
    if q.active {
        Json(state.core.active_alerts())
    } else {
        Json(state.core.alerts())
    }
}

async fn rate_limit(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Response, ApiError> {
    state
        .core
        .rate_limit_status(&source)
        .map(|s| Json(s).into_response())
        .ok_or_else(|| ApiError::not_found(format!("unknown source: {source}")))
}

/// Empty body means a full refresh.
async fn refresh(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let opts: RefreshOptions = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshOptions::full()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("invalid refresh options: {e}")))?
    };
    Ok(Json(state.core.refresh_now(opts).await).into_response())
}

async fn refresh_area(
    State(state): State<AppState>,
    Path(area): Path<String>,
) -> Result<Response, ApiError> {
    match state.core.refresh_area(&area).await {
        Ok(update) => Ok(Json(update).into_response()),
        Err(ConsolidationError::UnknownArea(a)) => {
            Err(ApiError::not_found(format!("unknown area: {a}")))
        }
        Err(e) => Err(ApiError(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

#[derive(Serialize)]
struct FocusResp {
    skipped: bool,
    status: crate::status::RefreshStatus,
}

async fn on_focus(State(state): State<AppState>) -> impl IntoResponse {
    match state.core.on_focus().await {
        Some(status) => Json(FocusResp {
            skipped: false,
            status,
        }),
        None => Json(FocusResp {
            skipped: true,
            status: state.core.refresh_status(),
        }),
    }
}

async fn on_reconnect(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.on_reconnect().await)
}

#[derive(Serialize)]
struct ToggleResp {
    source: String,
    enabled: bool,
}

fn toggle(state: &AppState, source: String, enabled: bool) -> ApiResult<ToggleResp> {
    if state.core.set_source_enabled(&source, enabled) {
        Ok(Json(ToggleResp { source, enabled }))
    } else {
        Err(ApiError::not_found(format!("unknown source: {source}")))
    }
}

async fn enable_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<ToggleResp> {
    toggle(&state, source, true)
}

async fn disable_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<ToggleResp> {
    toggle(&state, source, false)
}

#[derive(Serialize)]
struct RemovedResp {
    removed: usize,
}

async fn invalidate_cache(
    State(state): State<AppState>,
    Json(target): Json<CacheInvalidation>,
) -> ApiResult<RemovedResp> {
    let removed = state.core.invalidate_cache(&target).await?;
    Ok(Json(RemovedResp { removed }))
}

async fn clear_cache(State(state): State<AppState>) -> ApiResult<RemovedResp> {
    let removed = state.core.clear_cache().await?;
    Ok(Json(RemovedResp { removed }))
}
