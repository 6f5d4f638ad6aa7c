//! src/services/pipeline.rs
//!
//! EventPipeline: turns one storage finalize event into one stored verdict.
//!
//! Stages run strictly in order and stop at the first failure:
//! parse → validate → fetch → decode/preprocess → infer → persist.
//! Nothing is rolled back when a later stage fails; a redelivered event simply
//! overwrites the same document.

use crate::{
    models::{
        envelope::{AnalysisId, CloudEvent, EnvelopeError, EventEnvelope, ValidationError},
        result::InferenceResult,
    },
    services::{
        fetcher::{BlobFetcher, FetchError},
        inference::{self, Classifier, InferenceError},
        preprocess::{self, DecodeError},
        result_store::{PersistError, ResultStore},
    },
};
use axum::http::{HeaderMap, StatusCode};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Validate,
    Fetch,
    Preprocess,
    Infer,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::Fetch => "fetch",
            Stage::Preprocess => "preprocess",
            Stage::Infer => "infer",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Envelope(_) => Stage::Parse,
            Self::Validation(_) => Stage::Validate,
            Self::Fetch(_) => Stage::Fetch,
            Self::Decode(_) => Stage::Preprocess,
            Self::Inference(_) => Stage::Infer,
            Self::Persist(_) => Stage::Persist,
        }
    }

    /// 400 for problems with the event itself, 500 for everything downstream.
    pub fn status(&self) -> StatusCode {
        match self.stage() {
            Stage::Parse | Stage::Validate => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short caller-facing reason. Details stay in the log.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "Invalid CloudEvent payload",
            Self::Validation(ValidationError::NoFileName(_)) => "Object name has no file name",
            Self::Validation(_) => "Missing bucket or object name in event data",
            Self::Fetch(_) => "Failed to download image",
            Self::Decode(_) => "Failed to preprocess image",
            Self::Inference(_) => "Failed to run inference",
            Self::Persist(_) => "Failed to write result",
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub analysis_id: AnalysisId,
    pub document_id: String,
    pub result: InferenceResult,
}

/// The per-request orchestrator. Cheap to share: every collaborator is behind an `Arc`.
pub struct EventPipeline {
    fetcher: BlobFetcher,
    classifier: Arc<dyn Classifier>,
    results: Arc<dyn ResultStore>,
    event_type: String,
}

impl EventPipeline {
    pub fn new(
        fetcher: BlobFetcher,
        classifier: Arc<dyn Classifier>,
        results: Arc<dyn ResultStore>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            classifier,
            results,
            event_type: event_type.into(),
        }
    }

    /// Parse an HTTP-delivered CloudEvent and run it through every stage.
    pub async fn handle(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<PipelineOutcome, PipelineError> {
        let envelope = match self.parse(headers, body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    stage = %err.stage(),
                    error = %err,
                    "{}", err.reason()
                );
                return Err(err);
            }
        };
        self.run(&envelope).await
    }

    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> Result<EventEnvelope, PipelineError> {
        let event = CloudEvent::from_http(headers, body)?;
        event.expect_type(&self.event_type)?;
        info!(
            "received event {} from {} (subject: {})",
            event.id,
            event.source,
            event.subject.as_deref().unwrap_or("-")
        );
        Ok(EventEnvelope::from_event(&event)?)
    }

    /// Run the stages for an already-validated envelope, logging any failure
    /// with the bucket, object and stage it happened in.
    pub async fn run(&self, envelope: &EventEnvelope) -> Result<PipelineOutcome, PipelineError> {
        self.run_stages(envelope).await.inspect_err(|err| {
            error!(
                bucket = envelope.bucket(),
                object = envelope.object(),
                stage = %err.stage(),
                error = %err,
                "{}", err.reason()
            );
        })
    }

    async fn run_stages(&self, envelope: &EventEnvelope) -> Result<PipelineOutcome, PipelineError> {
        let (bucket, object) = (envelope.bucket(), envelope.object());
        let analysis_id = envelope.analysis_id()?;
        info!("processing {}/{} (analysis_id: {})", bucket, object, analysis_id);

        let scratch = self.fetcher.fetch(bucket, object).await?;
        info!(
            "downloaded {} bytes to {}",
            scratch.size_bytes(),
            scratch.path().display()
        );

        let path = scratch.path().to_path_buf();
        let shape = self.classifier.input_shape();
        let tensor = tokio::task::spawn_blocking(move || {
            let raw = preprocess::decode(&path)?;
            info!(
                "decoded {}x{} image ({} channels, {} byte depth)",
                raw.width(),
                raw.height(),
                raw.channels(),
                raw.byte_depth()
            );
            Ok::<_, DecodeError>(preprocess::preprocess(&raw, shape))
        })
        .await
        .map_err(|err| DecodeError::Worker(err.to_string()))??;
        info!("preprocessed tensor shape: {:?}", tensor.shape());

        let classifier = self.classifier.clone();
        let result = tokio::task::spawn_blocking(move || inference::infer(classifier.as_ref(), &tensor))
            .await
            .map_err(|err| InferenceError::Worker(err.to_string()))??;
        info!("inference result: {} ({:.2}%)", result.verdict, result.confidence);

        let document_id = self.results.upsert(&analysis_id, object, &result).await?;
        info!("wrote result document {}", document_id);

        Ok(PipelineOutcome {
            analysis_id,
            document_id,
            result,
        })
    }
}
