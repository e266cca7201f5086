#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use drishti_core::{Detection, Error, PredictionSession, Result, SessionSummary};
use drishti_pipeline::{
    ArtifactGateway, CallbackNotifier, LocalObjectStore, ObjectStore, ServiceContext,
};
use drishti_storage::{MetadataStore, RelationalStore, WideColumnStore};
use drishti_vision::{Detector, InferenceInvoker, LabelVocabulary, RawDetection, VisionError};
use image::RgbImage;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn both_backends() -> Vec<Arc<dyn MetadataStore>> {
    vec![
        Arc::new(RelationalStore::in_memory().unwrap()),
        Arc::new(WideColumnStore::temporary().unwrap()),
    ]
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Detector returning a fixed answer and counting calls
pub struct StubDetector {
    pub detections: Vec<RawDetection>,
    pub calls: AtomicUsize,
    /// Time each call takes, counted after the call is registered
    pub delay: Duration,
}

impl StubDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn person() -> Self {
        Self::new(vec![RawDetection::new("person", 0.91, [10.0, 10.0, 50.0, 80.0])])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for StubDetector {
    async fn detect(&self, _image_path: &Path) -> std::result::Result<Vec<RawDetection>, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.detections.clone())
    }
}

/// Object store wrapper counting every access
pub struct CountingObjectStore {
    inner: LocalObjectStore,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
}

impl CountingObjectStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalObjectStore::new(root, "test-bucket"),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn accesses(&self) -> usize {
        self.gets.load(Ordering::SeqCst) + self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingObjectStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub uid: String,
    pub chat_id: Option<String>,
    pub labels: Vec<String>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CallbackNotifier for RecordingNotifier {
    async fn notify(&self, uid: &str, chat_id: Option<&str>, labels: &[String]) -> Result<()> {
        self.sent.lock().push(Notification {
            uid: uid.to_string(),
            chat_id: chat_id.map(str::to_string),
            labels: labels.to_vec(),
        });
        if self.fail {
            return Err(Error::NotifyFailed("callback endpoint down".to_string()));
        }
        Ok(())
    }
}

/// Metadata store whose batch writes fail while `failing` is set
pub struct FlakyStore {
    inner: Arc<dyn MetadataStore>,
    pub failing: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            failing: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    fn overwrites_sessions(&self) -> bool {
        self.inner.overwrites_sessions()
    }

    async fn save_session(&self, uid: &str, original_ref: &str, predicted_ref: &str) -> Result<()> {
        self.inner.save_session(uid, original_ref, predicted_ref).await
    }

    async fn save_detection(&self, uid: &str, detection: &Detection) -> Result<()> {
        self.inner.save_detection(uid, detection).await
    }

    async fn get_session(&self, uid: &str) -> Result<PredictionSession> {
        self.inner.get_session(uid).await
    }

    async fn list_sessions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        self.inner.list_sessions_by_label(label).await
    }

    async fn list_sessions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        self.inner.list_sessions_by_score(min_score).await
    }

    async fn get_predicted_image_ref(&self, uid: &str) -> Result<String> {
        self.inner.get_predicted_image_ref(uid).await
    }

    async fn save_prediction(
        &self,
        uid: &str,
        original_ref: &str,
        predicted_ref: &str,
        detections: &[Detection],
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("database is locked".to_string()));
        }
        self.inner
            .save_prediction(uid, original_ref, predicted_ref, detections)
            .await
    }
}

/// Service context over temp directories with stub collaborators
pub struct Harness {
    pub dir: TempDir,
    pub objects: Arc<CountingObjectStore>,
    pub detector: Arc<StubDetector>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: ServiceContext,
}

impl Harness {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self::with(store, StubDetector::person(), RecordingNotifier::default())
    }

    pub fn with(store: Arc<dyn MetadataStore>, detector: StubDetector, notifier: RecordingNotifier) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(CountingObjectStore::new(&dir.path().join("objects")));
        let detector = Arc::new(detector);
        let notifier = Arc::new(notifier);

        let gateway = Arc::new(ArtifactGateway::new(objects.clone(), dir.path().join("uploads")));
        let invoker = Arc::new(InferenceInvoker::new(detector.clone(), LabelVocabulary::coco()));
        let ctx = ServiceContext::new(store, gateway, invoker, notifier.clone());

        Self {
            dir,
            objects,
            detector,
            notifier,
            ctx,
        }
    }

    /// Put a small PNG in the bucket without counting it as an access
    pub async fn seed_image(&self, key: &str) {
        self.objects
            .inner
            .put(key, Bytes::from(png_bytes(64, 96)))
            .await
            .unwrap();
    }
}
