//! Shared handler state.

use crate::services::{pipeline::EventPipeline, result_store::ResultStore};
use std::{path::PathBuf, sync::Arc};

/// Everything the handlers need, cloned per request.
///
/// The pipeline owns the loaded model; it is built once at startup and only
/// ever read afterwards.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EventPipeline>,
    pub results: Arc<dyn ResultStore>,
    pub scratch_dir: PathBuf,
}
