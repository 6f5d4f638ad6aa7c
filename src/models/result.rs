//! Classification verdicts and the documents they are stored as.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Top-1 output of the classifier for one image.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceResult {
    /// Class label from the model's label set.
    pub verdict: String,

    /// Probability of `verdict` as a percentage, two decimals.
    pub confidence: f64,
}

/// A stored verdict, keyed by analysis id.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ResultDocument {
    /// File stem of the analysed object; also the document key.
    pub analysis_id: String,

    pub verdict: String,

    pub confidence: f64,

    /// Object path the verdict was computed from.
    pub storage_path: String,

    /// Assigned by the store on every write.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}
