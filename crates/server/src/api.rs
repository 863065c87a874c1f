//! HTTP JSON API consumed by the dashboard

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use engine::{
    CredentialDraft, EngineError, ExchangeDescriptor, ExchangeHub, MarketPoller, ModeView,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::APP_VERSION;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ExchangeHub>,
    pub poller: Arc<MarketPoller>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/exchanges", get(api_exchanges))
        .route("/credentials", get(api_list_credentials).post(api_save_credentials))
        .route(
            "/credentials/:id",
            get(api_get_credentials).delete(api_delete_credentials),
        )
        .route("/credentials/:id/connect", post(api_connect))
        .route("/connection", get(api_connection))
        .route("/connection/disconnect", post(api_disconnect))
        .route("/mode", get(api_mode))
        .route("/mode/toggle", post(api_toggle_mode))
        .route("/markets", get(api_markets))
        .route("/markets/refresh", post(api_refresh_markets))
        .with_state(state)
}

/// Engine failure rendered as `{"success": false, ...}` with a matching status
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation { .. } | EngineError::UnsupportedExchange(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Connection(_) | EngineError::Fetch(_) => StatusCode::BAD_GATEWAY,
            EngineError::Storage(e) => {
                error!(error = %e, "Credential storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut body = json!({
            "success": false,
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        if let EngineError::Validation { field, .. } = &self.0 {
            body["field"] = json!(field);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// ============================================================================
// Service
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "spreadwatch",
        "version": APP_VERSION,
        "time": Utc::now(),
    }))
}

/// GET /api/exchanges: supported exchanges and their credential fields
async fn api_exchanges(State(state): State<AppState>) -> Json<serde_json::Value> {
    let exchanges: Vec<&ExchangeDescriptor> =
        state.hub.registry().list().iter().map(|d| d.as_ref()).collect();
    Json(json!({
        "success": true,
        "exchanges": exchanges,
    }))
}

// ============================================================================
// Credentials
// ============================================================================

/// GET /api/credentials: redacted summaries
async fn api_list_credentials(State(state): State<AppState>) -> ApiResult {
    let sets = state.hub.store().list().await?;
    let summaries: Vec<_> = sets.iter().map(|s| s.summary()).collect();
    Ok(Json(json!({
        "success": true,
        "count": summaries.len(),
        "credentials": summaries,
    })))
}

/// GET /api/credentials/:id
async fn api_get_credentials(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let set = state.hub.store().get(&id).await?;
    Ok(Json(json!({
        "success": true,
        "credentials": set.summary(),
    })))
}

/// POST /api/credentials: create, or replace when the body carries an id
async fn api_save_credentials(
    State(state): State<AppState>,
    Json(draft): Json<CredentialDraft>,
) -> ApiResult {
    let set = state.hub.save_credentials(draft).await?;
    info!(id = %set.id, exchange = %set.exchange_id, "Credential set saved via API");
    Ok(Json(json!({
        "success": true,
        "credentials": set.summary(),
    })))
}

/// DELETE /api/credentials/:id
async fn api_delete_credentials(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state.hub.delete_credentials(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Credential set deleted",
    })))
}

// ============================================================================
// Connection
// ============================================================================

/// POST /api/credentials/:id/connect: connection test; unlocks live mode on success
async fn api_connect(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.hub.connect_credentials(&id).await {
        Ok(status) => Ok(Json(json!({
            "success": true,
            "connection": status,
            "mode": ModeView::from(&state.hub.mode().snapshot()),
        }))),
        Err(e) => {
            warn!(id = %id, error = %e, "Connection test failed via API");
            Err(e.into())
        }
    }
}

/// GET /api/connection
async fn api_connection(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "connection": state.hub.status(),
    }))
}

/// POST /api/connection/disconnect
async fn api_disconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.hub.disconnect();
    Json(json!({
        "success": true,
        "connection": state.hub.status(),
    }))
}

// ============================================================================
// Mode
// ============================================================================

/// GET /api/mode
async fn api_mode(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "mode": ModeView::from(&state.hub.mode().snapshot()),
    }))
}

/// POST /api/mode/toggle: no-op until a connection test has succeeded
async fn api_toggle_mode(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mode = state.hub.mode();
    if !mode.can_disable_demo() {
        return Json(json!({
            "success": false,
            "message": "Connect an exchange successfully before leaving demo mode",
            "mode": ModeView::from(&mode.snapshot()),
        }));
    }
    mode.toggle_demo_mode();
    Json(json!({
        "success": true,
        "mode": ModeView::from(&mode.snapshot()),
    }))
}

// ============================================================================
// Markets
// ============================================================================

/// Query params for the markets endpoint
#[derive(Deserialize)]
struct MarketsParams {
    /// Return only the first `limit` ranked quotes
    limit: Option<usize>,
}

/// GET /api/markets: latest ranked snapshot
async fn api_markets(
    State(state): State<AppState>,
    Query(params): Query<MarketsParams>,
) -> Json<serde_json::Value> {
    let mut snapshot = state.poller.latest();
    if let Some(limit) = params.limit {
        snapshot.quotes.truncate(limit);
    }
    Json(json!({
        "success": true,
        "snapshot": snapshot,
    }))
}

/// POST /api/markets/refresh: poll now
async fn api_refresh_markets(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.poller.refresh().await;
    Json(json!({
        "success": snapshot.last_error.is_none(),
        "snapshot": snapshot,
    }))
}
