//! CloudEvent envelope for object-storage "finalized" notifications.
//!
//! Both HTTP content modes are accepted:
//! - **binary**: attributes travel as `ce-*` headers and the body is the event data
//! - **structured**: `Content-Type: application/cloudevents+json`, attributes and
//!   data (or `data_base64`) share one JSON document

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const SPEC_VERSION: &str = "1.0";
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";
pub const STORAGE_FINALIZED_TYPE: &str = "google.cloud.storage.object.v1.finalized";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("missing CloudEvent attribute `{0}`")]
    MissingAttribute(&'static str),
    #[error("unsupported CloudEvent specversion `{0}`")]
    UnsupportedSpecVersion(String),
    #[error("unexpected event type `{found}` (expected `{expected}`)")]
    UnexpectedType { expected: String, found: String },
    #[error("event data is not valid JSON: {0}")]
    InvalidData(String),
    #[error("malformed structured CloudEvent: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event data has no `bucket`")]
    MissingBucket,
    #[error("event data has no object `name`")]
    MissingObject,
    #[error("object path `{0}` has no file name")]
    NoFileName(String),
}

/// The attributes of a CloudEvent this service cares about, plus its data.
#[derive(Debug, Clone)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub subject: Option<String>,
    pub data: Option<Value>,
}

#[derive(Deserialize)]
struct StructuredEvent {
    specversion: Option<String>,
    id: Option<String>,
    source: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    subject: Option<String>,
    data: Option<Value>,
    data_base64: Option<String>,
}

impl CloudEvent {
    /// Parse a CloudEvent from an HTTP request's headers and body.
    pub fn from_http(headers: &HeaderMap, body: &[u8]) -> Result<Self, EnvelopeError> {
        let structured = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with(STRUCTURED_CONTENT_TYPE));

        if structured {
            Self::from_structured(body)
        } else {
            Self::from_binary(headers, body)
        }
    }

    fn from_binary(headers: &HeaderMap, body: &[u8]) -> Result<Self, EnvelopeError> {
        let attr = |name: &'static str| -> Option<String> {
            headers
                .get(format!("ce-{}", name))
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let spec_version = attr("specversion").ok_or(EnvelopeError::MissingAttribute("specversion"))?;
        ensure_spec_version(&spec_version)?;

        let data = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(
                serde_json::from_slice::<Value>(body)
                    .map_err(|err| EnvelopeError::InvalidData(err.to_string()))?,
            )
        };

        Ok(Self {
            id: required(attr("id"), "id")?,
            source: required(attr("source"), "source")?,
            event_type: required(attr("type"), "type")?,
            subject: attr("subject"),
            data,
        })
    }

    fn from_structured(body: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: StructuredEvent =
            serde_json::from_slice(body).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;

        let spec_version = required(raw.specversion, "specversion")?;
        ensure_spec_version(&spec_version)?;

        let data = match (raw.data, raw.data_base64) {
            (Some(_), Some(_)) => {
                return Err(EnvelopeError::Malformed(
                    "both `data` and `data_base64` are present".into(),
                ));
            }
            (Some(Value::String(text)), None) => Some(
                // string data carrying JSON is unwrapped, plain strings are kept
                serde_json::from_str(&text).unwrap_or(Value::String(text)),
            ),
            (Some(value), None) => Some(value),
            (None, Some(encoded)) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| EnvelopeError::InvalidData(err.to_string()))?;
                Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|err| EnvelopeError::InvalidData(err.to_string()))?,
                )
            }
            (None, None) => None,
        };

        Ok(Self {
            id: required(raw.id, "id")?,
            source: required(raw.source, "source")?,
            event_type: required(raw.event_type, "type")?,
            subject: raw.subject,
            data,
        })
    }

    /// Reject events whose `type` is not `expected`.
    pub fn expect_type(&self, expected: &str) -> Result<(), EnvelopeError> {
        if self.event_type == expected {
            Ok(())
        } else {
            Err(EnvelopeError::UnexpectedType {
                expected: expected.to_string(),
                found: self.event_type.clone(),
            })
        }
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, EnvelopeError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(EnvelopeError::MissingAttribute(name))
}

fn ensure_spec_version(version: &str) -> Result<(), EnvelopeError> {
    if version == SPEC_VERSION {
        Ok(())
    } else {
        Err(EnvelopeError::UnsupportedSpecVersion(version.to_string()))
    }
}

/// The bucket/object pair a finalize event points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    bucket: String,
    object: String,
}

impl EventEnvelope {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Result<Self, ValidationError> {
        let bucket = bucket.into();
        let object = object.into();
        if bucket.is_empty() {
            return Err(ValidationError::MissingBucket);
        }
        if object.is_empty() {
            return Err(ValidationError::MissingObject);
        }
        Ok(Self { bucket, object })
    }

    /// Extract `bucket` and `name` from the storage object payload.
    ///
    /// Non-string or absent fields count as missing.
    pub fn from_event(event: &CloudEvent) -> Result<Self, ValidationError> {
        let field = |name: &str| {
            event
                .data
                .as_ref()
                .and_then(|data| data.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self::new(field("bucket"), field("name"))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn analysis_id(&self) -> Result<AnalysisId, ValidationError> {
        AnalysisId::from_object_path(&self.object)
            .ok_or_else(|| ValidationError::NoFileName(self.object.clone()))
    }
}

/// Document key for a request's result: the object's file name without extension.
///
/// `uploads/2024/mole-17.jpg` becomes `mole-17`. Leading dots do not start an
/// extension, so `.hidden` stays `.hidden`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisId(String);

impl AnalysisId {
    pub fn from_object_path(path: &str) -> Option<Self> {
        let base = path.rsplit('/').next().unwrap_or(path);
        let stem = match base.rfind('.') {
            Some(idx) if base[..idx].bytes().any(|b| b != b'.') => &base[..idx],
            _ => base,
        };
        if stem.is_empty() {
            None
        } else {
            Some(Self(stem.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
