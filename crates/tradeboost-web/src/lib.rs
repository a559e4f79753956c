//! Axum JSON API for TradeBoost: call webhook ingestion, spend sync
//! trigger, dashboard metrics, profile management and compliance scanning.
//! The dashboard consumer is the product's SPA; user identity arrives as an
//! opaque path segment from the auth layer in front of this service.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

use tradeboost_core::CallEvent;
use tradeboost_storage::{ProfileUpdate, Store};
use tradeboost_sync::{
    CallIngest, ComplianceScanner, MetricsAggregator, Services, SpendSync, SyncConfig, SyncError,
};

pub const CRATE_NAME: &str = "tradeboost-web";

pub struct AppState {
    pub store: Store,
    pub ingest: CallIngest,
    pub metrics: MetricsAggregator,
    pub spend_sync: Option<Arc<SpendSync>>,
    pub scanner: ComplianceScanner,
}

impl From<Services> for AppState {
    fn from(services: Services) -> Self {
        Self {
            store: services.store,
            ingest: services.ingest,
            metrics: services.metrics,
            spend_sync: services.spend_sync,
            scanner: services.scanner,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/webhooks/calls", post(call_webhook_handler))
        .route("/users/{user_id}/sync", post(sync_handler))
        .route("/users/{user_id}/metrics", get(metrics_handler))
        .route("/users/{user_id}/spend", get(spend_handler))
        .route("/users/{user_id}/profile", put(profile_handler))
        .route("/compliance/scan", post(compliance_scan_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TB_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let config = SyncConfig::from_env();
    let services = Services::from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "tradeboost web listening");
    axum::serve(listener, app(services.into())).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// Inbound call event from the call-tracking provider. Redeliveries are
/// expected; `(provider, external_call_id)` makes them no-ops.
#[derive(Debug, Deserialize)]
struct CallWebhookRequest {
    user_id: String,
    provider: String,
    external_call_id: String,
    from_number: Option<String>,
    to_number: Option<String>,
    tracking_number: Option<String>,
    started_at_ms: i64,
    duration_seconds: i64,
    answered: bool,
}

async fn call_webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CallWebhookRequest>,
) -> Response {
    let Some(started_at) = DateTime::<Utc>::from_timestamp_millis(payload.started_at_ms) else {
        return validation_error(format!(
            "started_at_ms {} is not a valid epoch-ms instant",
            payload.started_at_ms
        ));
    };
    let Ok(duration_seconds) = u32::try_from(payload.duration_seconds) else {
        return validation_error(format!(
            "duration_seconds {} must be a non-negative integer",
            payload.duration_seconds
        ));
    };

    let event = CallEvent {
        user_id: payload.user_id,
        provider: payload.provider,
        external_call_id: payload.external_call_id,
        from_number: payload.from_number,
        to_number: payload.to_number,
        tracking_number: payload.tracking_number,
        started_at,
        duration_seconds,
        answered: payload.answered,
    };

    match state.ingest.record(event).await {
        Ok(recorded) => Json(recorded).into_response(),
        Err(err) => error_response(err),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    let Some(sync) = &state.spend_sync else {
        return error_response(SyncError::Auth(
            "ads platform credentials are not configured".to_string(),
        ));
    };
    match sync.refresh_current_month_if_stale(&user_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    }
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match state.metrics.dashboard_metrics(&user_id).await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(err) => error_response(err),
    }
}

async fn spend_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
) -> Response {
    match state.metrics.month_spend(&user_id).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    #[serde(default)]
    average_revenue_per_job: f64,
    timezone: Option<String>,
    google_customer_id: Option<String>,
    google_refresh_token: Option<String>,
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    Json(payload): Json<ProfileRequest>,
) -> Response {
    if user_id.trim().is_empty() {
        return error_response(SyncError::NotAuthenticated);
    }
    if payload.average_revenue_per_job < 0.0 {
        return validation_error("average_revenue_per_job must not be negative".to_string());
    }
    let timezone = payload
        .timezone
        .unwrap_or_else(|| "Europe/London".to_string());
    if timezone.parse::<chrono_tz::Tz>().is_err() {
        return validation_error(format!("timezone {timezone:?} is not a valid IANA zone"));
    }

    let update = ProfileUpdate {
        average_revenue_per_job: payload.average_revenue_per_job,
        timezone,
        google_customer_id: payload.google_customer_id,
        google_refresh_token: payload.google_refresh_token,
    };
    match state.store.upsert_profile(&user_id, &update, Utc::now()).await {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => error_response(SyncError::Store(err)),
    }
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    text: String,
}

async fn compliance_scan_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ScanRequest>,
) -> Response {
    Json(state.scanner.scan(&payload.text)).into_response()
}

fn validation_error(message: String) -> Response {
    error_response(SyncError::Validation(message))
}

/// Auth failures surface verbatim so the user can act on them; platform
/// and storage failures are logged in full and returned as generic
/// messages the UI shows next to a "Retry Sync" action.
fn error_response(err: SyncError) -> Response {
    let (status, message) = match &err {
        SyncError::NotAuthenticated => (StatusCode::UNAUTHORIZED, err.to_string()),
        SyncError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        SyncError::Auth(_) => (StatusCode::BAD_GATEWAY, err.to_string()),
        SyncError::Platform(_) => {
            error!("spend sync failed: {err}");
            (
                StatusCode::BAD_GATEWAY,
                "ads platform sync failed; please retry".to_string(),
            )
        }
        SyncError::Store(_) => {
            error!("storage failure: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal storage error".to_string(),
            )
        }
    };
    (status, Json(json!({ "error": message }))).into_response()
}
