//! Startup-time model bootstrap.
//!
//! The weights (an ONNX export of the classifier) and the label set live in
//! object storage. Both are downloaded once, the network is optimized for a
//! fixed `1x3xHxW` input, and the resulting `OnnxClassifier` is shared for the
//! lifetime of the process.

use crate::{
    models::pixels::{InputShape, PreprocessedTensor},
    services::{
        fetcher::{BlobFetcher, FetchError},
        inference::{Classifier, InferenceError},
    },
};
use std::{io, path::Path};
use thiserror::Error;
use tracing::info;
use tract_onnx::prelude::*;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to download `{path}` from bucket `{bucket}`: {source}")]
    Download {
        bucket: String,
        path: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to read label set `{path}`: {source}")]
    Labels {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("label set `{0}` is empty")]
    EmptyLabels(String),
    #[error("failed to build model from `{path}`: {reason}")]
    Model { path: String, reason: String },
}

/// Where the model artifacts live and what input they expect.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub bucket: String,
    pub weights_path: String,
    pub labels_path: String,
    pub input_shape: InputShape,
}

/// An optimized ONNX classification network plus its class names.
pub struct OnnxClassifier {
    plan: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    input_shape: InputShape,
}

impl OnnxClassifier {
    /// Build an optimized plan from an ONNX file on disk.
    pub fn from_path(
        path: &Path,
        labels: Vec<String>,
        input_shape: InputShape,
    ) -> Result<Self, StartupError> {
        let (h, w, _) = input_shape.dims();
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, h, w)))
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|err| StartupError::Model {
                path: path.display().to_string(),
                reason: format!("{:#}", err),
            })?;

        Ok(Self {
            plan,
            labels,
            input_shape,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn scores(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
        let (h, w, _) = self.input_shape.dims();
        let exec = |err: TractError| InferenceError::Execution(format!("{:#}", err));

        let tensor = tract_ndarray::Array4::from_shape_vec((1, 3, h, w), input.to_chw_vec())
            .map_err(|err| InferenceError::Execution(err.to_string()))?
            .into_tensor();
        let outputs = self.plan.run(tvec!(tensor.into())).map_err(exec)?;
        let first = outputs.first().ok_or(InferenceError::NoResults)?;
        let scores = first.to_array_view::<f32>().map_err(exec)?;
        Ok(scores.iter().copied().collect())
    }
}

/// Newline-separated class names in output order. Blank lines and `#` comments are skipped.
pub fn parse_labels(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Download the model artifacts and build the classifier.
///
/// Every failure here is fatal: the caller must not start serving without a model.
pub async fn load_model(
    fetcher: &BlobFetcher,
    artifacts: &ModelArtifacts,
) -> Result<OnnxClassifier, StartupError> {
    let bucket = &artifacts.bucket;
    info!(
        "loading model from {}/{} (labels {})",
        bucket, artifacts.weights_path, artifacts.labels_path
    );

    let download = |path: &str, source| StartupError::Download {
        bucket: bucket.clone(),
        path: path.to_string(),
        source,
    };

    let labels_file = fetcher
        .fetch(bucket, &artifacts.labels_path)
        .await
        .map_err(|err| download(&artifacts.labels_path, err))?;
    let labels_text = tokio::fs::read_to_string(labels_file.path())
        .await
        .map_err(|source| StartupError::Labels {
            path: artifacts.labels_path.clone(),
            source,
        })?;
    let labels = parse_labels(&labels_text);
    if labels.is_empty() {
        return Err(StartupError::EmptyLabels(artifacts.labels_path.clone()));
    }

    let weights = fetcher
        .fetch(bucket, &artifacts.weights_path)
        .await
        .map_err(|err| download(&artifacts.weights_path, err))?;
    info!(
        "weights downloaded ({} bytes) to {}",
        weights.size_bytes(),
        weights.path().display()
    );

    let input_shape = artifacts.input_shape;
    let weights_path = artifacts.weights_path.clone();
    let model = tokio::task::spawn_blocking(move || {
        // `weights` moves in so the scratch file outlives the build
        OnnxClassifier::from_path(weights.path(), labels, input_shape)
    })
    .await
    .map_err(|err| StartupError::Model {
        path: weights_path,
        reason: err.to_string(),
    })??;

    info!(
        "model ready: {} classes, input {}x{}",
        model.labels().len(),
        input_shape.height,
        input_shape.width
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{blob_store::MemoryBlobStore, inference::infer};
    use ndarray::{Array3, Axis};
    use std::sync::Arc;

    // GlobalAveragePool -> Flatten -> Softmax: one class per input channel
    const CHANNEL_MEAN_ONNX: &[u8] = include_bytes!("../../tests/fixtures/channel_mean.onnx");

    fn rgb_labels() -> Vec<String> {
        ["red", "green", "blue"].iter().map(|s| s.to_string()).collect()
    }

    /// All pixels set to 1.0 in `channel`, 0.0 elsewhere.
    fn solid(shape: InputShape, channel: usize) -> PreprocessedTensor {
        let mut data = Array3::<f32>::zeros(shape.dims());
        data.index_axis_mut(Axis(2), channel).fill(1.0);
        PreprocessedTensor::from_array(data)
    }

    fn artifacts() -> ModelArtifacts {
        ModelArtifacts {
            bucket: "models".into(),
            weights_path: "best.onnx".into(),
            labels_path: "labels.txt".into(),
            input_shape: InputShape::square(224),
        }
    }

    #[test]
    fn labels_skip_blanks_and_comments() {
        let labels = parse_labels("# exported classes\nbenign\n\n  malignant  \r\n");
        assert_eq!(labels, vec!["benign", "malignant"]);
    }

    #[tokio::test]
    async fn missing_weights_fail_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.put("models", "labels.txt", &b"benign\nmalignant\n"[..]);
        let fetcher = BlobFetcher::new(store, dir.path());

        let err = load_model(&fetcher, &artifacts()).await.err().unwrap();
        assert!(matches!(err, StartupError::Download { ref path, .. } if path == "best.onnx"));
    }

    #[tokio::test]
    async fn empty_label_set_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.put("models", "labels.txt", &b"\n# nothing\n"[..]);
        let fetcher = BlobFetcher::new(store, dir.path());

        let err = load_model(&fetcher, &artifacts()).await.err().unwrap();
        assert!(matches!(err, StartupError::EmptyLabels(_)));
    }

    #[tokio::test]
    async fn malformed_weights_fail_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.put("models", "labels.txt", &b"benign\n"[..]);
        store.put("models", "best.onnx", &b"this is not a protobuf"[..]);
        let fetcher = BlobFetcher::new(store, dir.path());

        let err = load_model(&fetcher, &artifacts()).await.err().unwrap();
        assert!(matches!(err, StartupError::Model { .. }));
    }

    #[test]
    fn onnx_model_scores_one_value_per_class() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel_mean.onnx");
        std::fs::write(&path, CHANNEL_MEAN_ONNX).unwrap();
        let shape = InputShape::square(8);

        let model = OnnxClassifier::from_path(&path, rgb_labels(), shape).unwrap();
        assert_eq!(model.input_shape(), shape);

        let scores = model.scores(&solid(shape, 1)).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        // channel means [0, 1, 0]: e / (e + 2)
        assert!((scores[1] - 0.576_117).abs() < 1e-4);

        for (channel, label) in rgb_labels().iter().enumerate() {
            let result = infer(&model, &solid(shape, channel)).unwrap();
            assert_eq!(&result.verdict, label);
            assert_eq!(result.confidence, 57.61);
        }
    }

    #[tokio::test]
    async fn load_model_builds_classifier_for_configured_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.put("models", "labels.txt", &b"red\ngreen\nblue\n"[..]);
        store.put("models", "best.onnx", CHANNEL_MEAN_ONNX);
        let fetcher = BlobFetcher::new(store, dir.path());
        let shape = InputShape {
            height: 6,
            width: 10,
        };

        let model = load_model(
            &fetcher,
            &ModelArtifacts {
                input_shape: shape,
                ..artifacts()
            },
        )
        .await
        .unwrap();

        assert_eq!(model.labels(), rgb_labels().as_slice());
        assert_eq!(infer(&model, &solid(shape, 2)).unwrap().verdict, "blue");
        assert!(matches!(
            infer(&model, &solid(InputShape::square(8), 2)),
            Err(InferenceError::ShapeMismatch { .. })
        ));
        // scratch copies of the artifacts are gone once loading finishes
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
