//! Read-back of stored verdicts.

use crate::{errors::AppError, models::result::ResultDocument, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
};

/// `GET /results/{analysis_id}`: the stored document as JSON, or 404.
pub async fn get_result(
    State(state): State<AppState>,
    Path(analysis_id): Path<String>,
) -> Result<Json<ResultDocument>, AppError> {
    state
        .results
        .get(&analysis_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("No result for `{}`", analysis_id)))
}
