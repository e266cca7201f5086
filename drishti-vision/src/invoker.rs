//! Inference invoker: detector call, output normalization and annotation.

use crate::annotate::annotate_image;
use crate::detector::{CommandDetector, Detector, DisabledDetector, RawDetection};
use crate::error::VisionError;
use crate::labels::LabelVocabulary;
use drishti_core::config::InferenceConfig;
use drishti_core::{BoundingBox, Detection, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct InferenceInvoker {
    detector: Arc<dyn Detector>,
    vocabulary: LabelVocabulary,
}

impl InferenceInvoker {
    pub fn new(detector: Arc<dyn Detector>, vocabulary: LabelVocabulary) -> Self {
        Self {
            detector,
            vocabulary,
        }
    }

    /// Build from configuration. Without a command every detection fails
    /// with a configuration error.
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let detector: Arc<dyn Detector> = match &config.command {
            Some(command) => Arc::new(CommandDetector::from_command_line(command, &config.args)?),
            None => {
                warn!("No detector command configured; prediction requests will fail");
                Arc::new(DisabledDetector)
            }
        };
        let vocabulary = match &config.labels {
            Some(labels) => LabelVocabulary::new(labels.iter().cloned()),
            None => LabelVocabulary::coco(),
        };
        info!("Inference invoker ready with {} labels", vocabulary.len());
        Ok(Self::new(detector, vocabulary))
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocabulary
    }

    /// Run detection on `input` and write the annotated image to `output`.
    ///
    /// Returns the normalized detections in detector order. An empty list
    /// is a valid result. Any failure is `Error::InferenceFailed`.
    pub async fn detect(&self, input: &Path, output: &Path) -> Result<Vec<Detection>> {
        let raw = self.detector.detect(input).await?;
        let detections = normalize_detections(raw, &self.vocabulary);
        debug!("Detector returned {} usable detections for {:?}", detections.len(), input);

        let input: PathBuf = input.to_path_buf();
        let output: PathBuf = output.to_path_buf();
        let boxes = detections.clone();
        tokio::task::spawn_blocking(move || annotate_image(&input, &output, &boxes))
            .await
            .map_err(|e| VisionError::Annotation(format!("annotation task failed: {}", e)))??;

        Ok(detections)
    }
}

/// Coerce raw detector output into valid detections.
///
/// Labels are trimmed and must belong to the vocabulary. Box corners are
/// reordered and scores clamped into `[0, 1]`. Entries with non-finite
/// numbers are dropped.
pub fn normalize_detections(raw: Vec<RawDetection>, vocabulary: &LabelVocabulary) -> Vec<Detection> {
    raw.into_iter()
        .filter_map(|r| {
            let label = r.label.trim();
            if label.is_empty() {
                warn!("Dropping detection with empty label");
                return None;
            }
            if !vocabulary.contains(label) {
                warn!("Dropping detection with unknown label '{}'", label);
                return None;
            }
            if !r.score.is_finite() || !r.bbox.iter().all(|v| v.is_finite()) {
                warn!("Dropping detection '{}' with non-finite values", label);
                return None;
            }

            let [a, b, c, d] = r.bbox;
            let bbox = BoundingBox::new(a.min(c), b.min(d), a.max(c), b.max(d)).ok()?;
            Detection::new(label, r.score.clamp(0.0, 1.0), bbox).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::RgbImage;

    struct FixedDetector(Vec<RawDetection>);

    #[async_trait]
    impl Detector for FixedDetector {
        async fn detect(&self, _image_path: &Path) -> std::result::Result<Vec<RawDetection>, VisionError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_normalize_cleans_output() {
        let vocab = LabelVocabulary::coco();
        let raw = vec![
            RawDetection::new(" person ", 0.91, [10.0, 10.0, 50.0, 80.0]),
            RawDetection::new("dog", 1.2, [50.0, 80.0, 10.0, 10.0]),
            RawDetection::new("", 0.5, [0.0, 0.0, 1.0, 1.0]),
            RawDetection::new("unicorn", 0.5, [0.0, 0.0, 1.0, 1.0]),
            RawDetection::new("cat", f64::NAN, [0.0, 0.0, 1.0, 1.0]),
            RawDetection::new("cat", 0.3, [0.0, f64::INFINITY, 1.0, 1.0]),
        ];

        let out = normalize_detections(raw, &vocab);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "person");
        assert_eq!(out[0].bbox.as_array(), [10.0, 10.0, 50.0, 80.0]);
        assert_eq!(out[1].label, "dog");
        assert_eq!(out[1].score, 1.0);
        assert_eq!(out[1].bbox.as_array(), [10.0, 10.0, 50.0, 80.0]);
    }

    #[tokio::test]
    async fn test_detect_writes_annotated_image() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("original.png");
        let output = dir.path().join("predicted.png");
        RgbImage::new(64, 64).save(&input).unwrap();

        let invoker = InferenceInvoker::new(
            Arc::new(FixedDetector(vec![RawDetection::new("person", 0.91, [10.0, 10.0, 50.0, 60.0])])),
            LabelVocabulary::coco(),
        );
        let detections = invoker.detect(&input, &output).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_zero_detections_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.png");
        RgbImage::new(8, 8).save(&input).unwrap();

        let invoker = InferenceInvoker::new(Arc::new(FixedDetector(vec![])), LabelVocabulary::coco());
        let detections = invoker.detect(&input, &dir.path().join("out.png")).await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_detector_fails() {
        let invoker = InferenceInvoker::from_config(&InferenceConfig::default()).unwrap();
        let err = invoker
            .detect(Path::new("missing.png"), Path::new("out.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, drishti_core::Error::Configuration(_)));
    }
}
