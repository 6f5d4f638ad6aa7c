//! src/services/blob_store.rs
//!
//! Read-only object storage backends. The pipeline only ever downloads, so the
//! surface is a single `open_object` returning a byte stream.
//!
//! - `FsBlobStore` reads `base_path/{bucket}/{key}` from local disk
//! - `HttpBlobStore` issues `GET {endpoint}/{bucket}/{key}` (GCS XML API,
//!   S3-style path addressing) with an optional bearer token
//! - `MemoryBlobStore` keeps objects in a map, for tests and local wiring

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use reqwest::{StatusCode, Url, header};
use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    pin::Pin,
    sync::{PoisonError, RwLock},
    time::Duration,
};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_BUCKET_NAME_LEN: usize = 222;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("bucket `{0}` is not a valid bucket name")]
    InvalidBucketName(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("storage endpoint returned HTTP {status} for `{bucket}/{key}`")]
    UnexpectedStatus {
        status: u16,
        bucket: String,
        key: String,
    },
    #[error("invalid storage endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BlobStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. })
    }
}

pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Download access to a bucket/key namespace.
///
/// Implementations are shared across concurrent requests.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open `bucket/key` for reading. Missing objects yield `ObjectNotFound`.
    async fn open_object(&self, bucket: &str, key: &str) -> BlobStoreResult<ByteStream>;
}

/// Rejects keys that begin with `/`, contain `..` segments or control bytes.
fn ensure_key_safe(key: &str) -> BlobStoreResult<()> {
    let invalid = || BlobStoreError::InvalidObjectKey(key.to_string());
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Err(invalid());
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    Ok(())
}

/// Bucket names become a single path segment; anything that could escape it is refused.
fn ensure_bucket_name_safe(name: &str) -> BlobStoreResult<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_BUCKET_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(BlobStoreError::InvalidBucketName(name.to_string()))
    }
}

/// Objects stored as plain files under `base_path/{bucket}/{key}`.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    pub base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.base_path.join(bucket);
        path.extend(key.split('/').filter(|s| !s.is_empty()));
        path
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open_object(&self, bucket: &str, key: &str) -> BlobStoreResult<ByteStream> {
        ensure_bucket_name_safe(bucket)?;
        ensure_key_safe(key)?;

        let path = self.object_path(bucket, key);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                BlobStoreError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                BlobStoreError::Io(err)
            }
        })?;
        // directories open fine on unix but fail on first read; report them as missing
        if file.metadata().await?.is_dir() {
            return Err(BlobStoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        debug!("opened {} for reading", path.display());
        Ok(Box::pin(ReaderStream::new(file)))
    }
}

/// Objects fetched over HTTP from a path-addressed endpoint.
#[derive(Clone, Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: Url,
    bearer_token: Option<String>,
}

impl HttpBlobStore {
    /// Build a store for `endpoint`; every request is bounded by `timeout`.
    pub fn new(
        endpoint: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> BlobStoreResult<Self> {
        let endpoint = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| BlobStoreError::InvalidEndpoint(endpoint.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            bearer_token,
        })
    }

    /// `{endpoint}/{bucket}/{key}` with every key segment percent-encoded.
    pub fn object_url(&self, bucket: &str, key: &str) -> BlobStoreResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BlobStoreError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn open_object(&self, bucket: &str, key: &str) -> BlobStoreResult<ByteStream> {
        ensure_bucket_name_safe(bucket)?;
        ensure_key_safe(key)?;

        let url = self.object_url(bucket, key)?;
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.bearer_token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => {
                debug!("GET {} -> {}", url, status);
                Ok(Box::pin(response.bytes_stream().map_err(io::Error::other)))
            }
            StatusCode::NOT_FOUND => Err(BlobStoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status => Err(BlobStoreError::UnexpectedStatus {
                status: status.as_u16(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

/// In-process store keyed by (bucket, key).
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), key.to_string()), body.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_object(&self, bucket: &str, key: &str) -> BlobStoreResult<ByteStream> {
        let body = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BlobStoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(stream::once(async move { Ok::<_, io::Error>(body) }).boxed())
    }
}
