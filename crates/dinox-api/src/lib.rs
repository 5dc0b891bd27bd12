//! dinox-api — status API for the dinox supervisor.
//!
//! Exposes the health monitor's snapshot read-only and lets an operator
//! stop or start the supervised service.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/status` | Current health snapshot and stop flag |
//! | GET | `/healthz` | Liveness of the supervisor itself |
//! | POST | `/service/stop` | Stop the service and keep it down |
//! | POST | `/service/start` | Clear the stop flag and start the service |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::{mpsc, watch};

use dinox_health::{HealthSnapshot, StopFlag, SupervisorCommand};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: String,
    pub status: watch::Receiver<HealthSnapshot>,
    pub stop: StopFlag,
    pub commands: mpsc::Sender<SupervisorCommand>,
}

/// Build the status API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/healthz", get(handlers::healthz))
        .route("/service/stop", post(handlers::stop_service))
        .route("/service/start", post(handlers::start_service))
        .with_state(state)
}
