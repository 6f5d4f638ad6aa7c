//! Inbound storage events.

use crate::{errors::AppError, state::AppState};
use axum::{body::Bytes, extract::State, http::HeaderMap};
use tracing::error;

/// `POST /`: an Eventarc-style CloudEvent announcing a finalized object.
///
/// The pipeline runs on its own task: if the caller disconnects mid-request,
/// downloads and writes already in flight still finish instead of being dropped.
/// Replies `200 OK`, or the failing stage's status with a plain-text reason.
pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, AppError> {
    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.handle(&headers, &body).await });

    match task.await {
        Ok(Ok(_outcome)) => Ok("OK"),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => {
            error!("pipeline task failed: {}", err);
            Err(AppError::internal("Internal error"))
        }
    }
}
