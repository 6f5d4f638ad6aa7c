#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response, StatusCode},
};
use derma_inference::{
    models::{
        envelope::STORAGE_FINALIZED_TYPE,
        pixels::{InputShape, PreprocessedTensor},
    },
    routes,
    services::{
        blob_store::MemoryBlobStore,
        fetcher::BlobFetcher,
        inference::{Classifier, InferenceError},
        pipeline::EventPipeline,
        result_store::SqliteResultStore,
    },
    state::AppState,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tower::ServiceExt;

pub const LABELS: [&str; 3] = ["benign", "malignant", "indeterminate"];
pub const INPUT_SIDE: u32 = 224;

/// Deterministic stand-in for the ONNX model: favours "malignant" for reddish
/// images and "benign" otherwise, and records the shapes it was fed.
pub struct StubClassifier {
    labels: Vec<String>,
    pub calls: AtomicUsize,
    pub seen_shapes: Mutex<Vec<(usize, usize, usize)>>,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self {
            labels: LABELS.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
            seen_shapes: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for StubClassifier {
    fn input_shape(&self) -> InputShape {
        InputShape::square(INPUT_SIDE)
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn scores(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_shapes.lock().unwrap().push(input.shape());
        let view = input.view();
        let n = (view.len() / 3) as f32;
        let red: f32 = view.iter().step_by(3).sum::<f32>() / n;
        let red = red.clamp(0.0, 1.0);
        Ok(vec![(1.0 - red) * 0.9, red * 0.9, 0.1])
    }
}

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub blobs: Arc<MemoryBlobStore>,
    pub classifier: Arc<StubClassifier>,
    pub results: Arc<SqliteResultStore>,
    pub router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let classifier = Arc::new(StubClassifier::new());

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let results = Arc::new(SqliteResultStore::new(Arc::new(pool)));
        results.migrate().await.unwrap();

        let scratch_dir = dir.path().join("scratch");
        let pipeline = EventPipeline::new(
            BlobFetcher::new(blobs.clone(), scratch_dir.clone()),
            classifier.clone(),
            results.clone(),
            STORAGE_FINALIZED_TYPE,
        );
        let state = AppState {
            pipeline: Arc::new(pipeline),
            results: results.clone(),
            scratch_dir,
        };
        let router = routes::routes::routes().with_state(state);

        Self {
            dir,
            blobs,
            classifier,
            results,
            router,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        read(response).await
    }

    pub async fn post_event(&self, data: Value) -> (StatusCode, String) {
        self.send(binary_event(data)).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, String) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub fn scratch_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("scratch"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

pub async fn read(response: Response<Body>) -> (StatusCode, String) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// A binary-mode CloudEvent as Eventarc delivers it.
pub fn binary_event(data: Value) -> Request<Body> {
    Request::post("/")
        .header("content-type", "application/json")
        .header("ce-specversion", "1.0")
        .header("ce-id", "1234567890")
        .header("ce-source", "//storage.googleapis.com/projects/_/buckets/scans")
        .header("ce-type", STORAGE_FINALIZED_TYPE)
        .header("ce-subject", "objects/uploads/a.jpg")
        .body(Body::from(data.to_string()))
        .unwrap()
}

pub fn storage_object(bucket: &str, name: &str) -> Value {
    json!({
        "bucket": bucket,
        "name": name,
        "contentType": "image/jpeg",
        "size": "1024",
        "generation": "1700000000000000",
    })
}

pub fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}
