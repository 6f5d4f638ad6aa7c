//! Data types passed between the pipeline stages.
//!
//! An inbound event becomes an `EventEnvelope`, the fetched object a `RawImage`,
//! then a `PreprocessedTensor`, an `InferenceResult` and finally a stored
//! `ResultDocument`.

pub mod envelope;
pub mod pixels;
pub mod result;
