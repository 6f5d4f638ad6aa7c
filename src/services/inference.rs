//! Single-image classification on top of a loaded model.

use crate::models::{
    pixels::{InputShape, PreprocessedTensor},
    result::InferenceResult,
};
use thiserror::Error;

/// Tolerance used to decide whether raw scores already form a probability distribution.
const DISTRIBUTION_EPSILON: f32 = 1e-3;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("input tensor {found:?} does not match model input {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
    #[error("model execution failed: {0}")]
    Execution(String),
    #[error("model returned no results")]
    NoResults,
    #[error("model returned no finite scores")]
    NonFinite,
    #[error("class index {index} is outside the label set ({labels} labels)")]
    UnknownClass { index: usize, labels: usize },
    #[error("inference worker failed: {0}")]
    Worker(String),
}

/// A loaded image classifier, shared read-only by all requests.
pub trait Classifier: Send + Sync {
    /// Resolution the model was built for.
    fn input_shape(&self) -> InputShape;

    /// Class names, indexed like the model's output.
    fn labels(&self) -> &[String];

    /// Raw per-class scores for one image.
    fn scores(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError>;
}

/// Classify one preprocessed image and report the top-1 class.
pub fn infer(
    model: &dyn Classifier,
    input: &PreprocessedTensor,
) -> Result<InferenceResult, InferenceError> {
    let expected = model.input_shape().dims();
    if input.shape() != expected {
        return Err(InferenceError::ShapeMismatch {
            expected,
            found: input.shape(),
        });
    }
    let scores = model.scores(input)?;
    top_class(&scores, model.labels())
}

/// Pick the arg-max class and express its probability as a percentage.
pub fn top_class(scores: &[f32], labels: &[String]) -> Result<InferenceResult, InferenceError> {
    if scores.is_empty() {
        return Err(InferenceError::NoResults);
    }
    let probs = to_probabilities(scores);

    let (index, prob) = probs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
        .ok_or(InferenceError::NonFinite)?;

    let verdict = labels
        .get(index)
        .cloned()
        .ok_or(InferenceError::UnknownClass {
            index,
            labels: labels.len(),
        })?;

    Ok(InferenceResult {
        verdict,
        confidence: percentage(prob),
    })
}

/// Classification heads usually end in softmax already; logits are normalized here.
///
/// `+inf` scores split all the probability mass between them and `-inf` scores
/// get none. NaN scores stay NaN and are skipped by the caller.
fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let winners = scores.iter().filter(|s| **s == f32::INFINITY).count();
    if winners > 0 {
        let share = 1.0 / winners as f32;
        return scores
            .iter()
            .map(|&s| {
                if s == f32::INFINITY {
                    share
                } else if s.is_nan() {
                    f32::NAN
                } else {
                    0.0
                }
            })
            .collect();
    }

    let finite = || scores.iter().copied().filter(|s| s.is_finite());
    let in_unit_range = finite().all(|s| (0.0..=1.0).contains(&s));
    let sum: f32 = finite().sum();
    if in_unit_range && (sum - 1.0).abs() <= DISTRIBUTION_EPSILON {
        return scores.to_vec();
    }

    let max = finite().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return scores.to_vec();
    }
    // exp(-inf) is 0 and NaN propagates
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().copied().filter(|e| e.is_finite()).sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Probability in [0, 1] to a percentage rounded to two decimals.
fn percentage(prob: f32) -> f64 {
    let pct = (f64::from(prob) * 100.0).clamp(0.0, 100.0);
    (pct * 100.0).round() / 100.0
}
