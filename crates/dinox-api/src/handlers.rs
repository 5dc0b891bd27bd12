//! REST API handlers.
//!
//! Status reads come from the monitor's `watch` channel; operator actions
//! flip the stop flag and forward a command to the process supervisor.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use dinox_health::{HealthSnapshot, SupervisorCommand};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Status body: the monitor snapshot plus service identity.
#[derive(serde::Serialize)]
pub struct ServiceStatus {
    pub service: String,
    #[serde(flatten)]
    pub health: HealthSnapshot,
    pub stopped_by_operator: bool,
}

/// GET /status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let health = state.status.borrow().clone();
    ApiResponse::ok(ServiceStatus {
        service: state.service.clone(),
        health,
        stopped_by_operator: state.stop.is_set(),
    })
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// POST /service/stop
pub async fn stop_service(State(state): State<ApiState>) -> impl IntoResponse {
    state.stop.set();
    info!(service = %state.service, "operator stop requested");
    forward(&state, SupervisorCommand::Stop, "stopping").await
}

/// POST /service/start
pub async fn start_service(State(state): State<ApiState>) -> impl IntoResponse {
    state.stop.clear();
    info!(service = %state.service, "operator start requested");
    forward(&state, SupervisorCommand::Start, "starting").await
}

async fn forward(state: &ApiState, command: SupervisorCommand, label: &str) -> axum::response::Response {
    match state.commands.send(command).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "service": state.service,
                "status": label,
            })),
        )
            .into_response(),
        Err(_) => error_response("process supervisor is not running", StatusCode::SERVICE_UNAVAILABLE)
            .into_response(),
    }
}
