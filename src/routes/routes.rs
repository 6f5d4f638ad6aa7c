//! Defines the service's HTTP surface.
//!
//! ## Structure
//! - `POST /`                       CloudEvent delivery (object finalized)
//! - `GET  /results/{analysis_id}`  stored verdict for an analysis id
//! - `GET  /healthz`, `GET /readyz`  liveness and readiness probes

use crate::{
    handlers::{
        event_handlers::receive_event,
        health_handlers::{healthz, readyz},
        result_handlers::get_result,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share `AppState`, which carries the loaded model.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/results/{analysis_id}", get(get_result))
        .route("/", post(receive_event))
}
