//! Admin control API
//!
//! A small axum router over the controller's engines: records, paused
//! traffic and the global enable switches.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use intercept_common::{Headers, HttpRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::breakpoint::PausedRequest;
use crate::config::AdminConfig;
use crate::controller::InterceptController;
use crate::error::{CoreError, Result};
use crate::store::TrafficRecord;

type AdminState = Arc<InterceptController>;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub total_requests: u64,
    pub error_count: u64,
    pub pending_count: u64,
    pub retained_records: usize,
    pub max_records: usize,
    pub paused_requests: usize,
    pub mock_rules: usize,
    pub breakpoint_rules: usize,
    pub mocks_enabled: bool,
    pub breakpoints_enabled: bool,
    pub trust_mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

/// Optional edit sent with a resume. `request` applies to request pauses,
/// `status_code` and `headers` to response pauses.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResumeBody {
    #[serde(default)]
    pub request: Option<HttpRequest>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<Headers>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

pub fn router(controller: Arc<InterceptController>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/records", get(list_records).delete(clear_records))
        .route("/records/:id", get(get_record).delete(delete_record))
        .route("/breakpoints/paused", get(list_paused))
        .route("/breakpoints/paused/:id/resume", post(resume_paused))
        .route("/breakpoints/paused/:id/cancel", post(cancel_paused))
        .route("/breakpoints/resume-all", post(resume_all))
        .route("/breakpoints/cancel-all", post(cancel_all))
        .route("/mocks/enabled", put(set_mocks_enabled))
        .route("/breakpoints/enabled", put(set_breakpoints_enabled))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

pub async fn start_admin_server(config: &AdminConfig, controller: Arc<InterceptController>) -> Result<()> {
    let addr = config.bind_address();
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoreError::Network(format!("Failed to bind admin address {}: {}", addr, e)))?;

    axum::serve(listener, router(controller))
        .await
        .map_err(|e| CoreError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(controller): State<AdminState>) -> Json<MetricsResponse> {
    let stats = controller.store().stats();
    Json(MetricsResponse {
        total_requests: stats.total_requests,
        error_count: stats.error_count,
        pending_count: stats.pending_count,
        retained_records: stats.retained,
        max_records: stats.max_records,
        paused_requests: controller.breakpoints().paused_count(),
        mock_rules: controller.mocks().rules().len(),
        breakpoint_rules: controller.breakpoints().rules().len(),
        mocks_enabled: controller.mocks().is_enabled(),
        breakpoints_enabled: controller.breakpoints().is_enabled(),
        trust_mode: controller.trust().mode().label().to_string(),
    })
}

async fn list_records(State(controller): State<AdminState>) -> Json<Vec<TrafficRecord>> {
    Json(controller.store().records())
}

async fn get_record(
    State(controller): State<AdminState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<TrafficRecord>, StatusCode> {
    controller.store().get(id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn clear_records(State(controller): State<AdminState>) -> StatusCode {
    controller.store().clear();
    StatusCode::NO_CONTENT
}

async fn delete_record(State(controller): State<AdminState>, Path(id): Path<Uuid>) -> StatusCode {
    found(controller.store().remove(id))
}

async fn list_paused(State(controller): State<AdminState>) -> Json<Vec<PausedRequest>> {
    Json(controller.breakpoints().paused())
}

async fn resume_paused(
    State(controller): State<AdminState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResumeBody>>,
) -> StatusCode {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let breakpoints = controller.breakpoints();

    let resolved = match body {
        ResumeBody {
            request: Some(request),
            ..
        } => breakpoints.resume_with_request(id, request),
        ResumeBody {
            status_code: Some(status_code),
            headers,
            ..
        } => breakpoints.resume_with_response(id, status_code, headers.unwrap_or_default()),
        _ => breakpoints.resume(id),
    };
    found(resolved)
}

async fn cancel_paused(State(controller): State<AdminState>, Path(id): Path<Uuid>) -> StatusCode {
    found(controller.breakpoints().cancel(id))
}

async fn resume_all(State(controller): State<AdminState>) -> Json<CountResponse> {
    Json(CountResponse {
        count: controller.breakpoints().resume_all(),
    })
}

async fn cancel_all(State(controller): State<AdminState>) -> Json<CountResponse> {
    Json(CountResponse {
        count: controller.breakpoints().cancel_all(),
    })
}

async fn set_mocks_enabled(
    State(controller): State<AdminState>,
    Json(body): Json<EnabledBody>,
) -> Json<EnabledBody> {
    controller.mocks().set_enabled(body.enabled);
    Json(body)
}

async fn set_breakpoints_enabled(
    State(controller): State<AdminState>,
    Json(body): Json<EnabledBody>,
) -> Json<EnabledBody> {
    controller.breakpoints().set_enabled(body.enabled);
    Json(body)
}

/// 204 when the target existed (and was still unresolved), else 404
fn found(done: bool) -> StatusCode {
    if done {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
