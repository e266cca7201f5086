//! Domain types shared by every crate: prediction sessions, detections,
//! bounding boxes and the image vocabularies used by the API.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Image extensions accepted anywhere in the system (lowercase, with dot).
pub const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left and `(x2, y2)`
/// bottom-right. Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(Error::Validation(
                "Bounding box coordinates must be finite".to_string(),
            ));
        }
        if x1 > x2 || y1 > y2 {
            return Err(Error::Validation(format!(
                "Bounding box corners out of order: ({}, {}, {}, {})",
                x1, y1, x2, y2
            )));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = Error;

    fn try_from(value: [f64; 4]) -> Result<Self> {
        BoundingBox::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(bbox: BoundingBox) -> Self {
        bbox.as_array()
    }
}

/// One labeled, scored finding, before it is attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f64, bbox: BoundingBox) -> Result<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(Error::Validation("Detection label must not be empty".to_string()));
        }
        // Labels are embedded in storage keys, where \0 is the separator.
        if label.chars().any(|c| c.is_control()) {
            return Err(Error::Validation(
                "Detection label contains control characters".to_string(),
            ));
        }
        validate_score(score)?;
        Ok(Self { label, score, bbox })
    }

    /// Re-checks invariants on a value that may have been built field by field.
    pub fn validate(&self) -> Result<()> {
        Detection::new(self.label.clone(), self.score, self.bbox).map(|_| ())
    }
}

/// A detection as persisted: owned by exactly one prediction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionObject {
    pub prediction_uid: String,
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl DetectionObject {
    pub fn new(prediction_uid: impl Into<String>, detection: Detection) -> Self {
        Self {
            prediction_uid: prediction_uid.into(),
            label: detection.label,
            score: detection.score,
            bbox: detection.bbox,
        }
    }

    pub fn detection(&self) -> Detection {
        Detection {
            label: self.label.clone(),
            score: self.score,
            bbox: self.bbox,
        }
    }
}

/// A complete prediction job: source image, annotated image and findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionSession {
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub original_image_ref: String,
    pub predicted_image_ref: String,
    pub detections: Vec<DetectionObject>,
}

impl PredictionSession {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            uid: self.uid.clone(),
            created_at: self.created_at,
        }
    }

    /// Labels in detection order, duplicates kept.
    pub fn labels(&self) -> Vec<String> {
        self.detections.iter().map(|d| d.label.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub uid: String,
    pub created_at: DateTime<Utc>,
}

/// Which of the two images of a session is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Original,
    Predicted,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Original => "original",
            ImageKind::Predicted => "predicted",
        }
    }
}

impl FromStr for ImageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "original" => Ok(ImageKind::Original),
            "predicted" => Ok(ImageKind::Predicted),
            other => Err(Error::Validation(format!("Invalid image type: {}", other))),
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image encodings the service can hand out. The server never transcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    /// Extension used when a raw upload of this type is staged.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => ".png",
            ImageFormat::Jpeg => ".jpg",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

/// Returns the lowercase extension (with dot) of `name` if it is allowed.
pub fn image_extension(name: &str) -> Result<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(Error::InvalidExtension(if ext.is_empty() {
            format!("'{}' has no extension", name)
        } else {
            ext
        }))
    }
}

/// Confidence scores and score thresholds live in `[0, 1]`.
pub fn validate_score(score: f64) -> Result<f64> {
    if score.is_nan() || !(0.0..=1.0).contains(&score) {
        return Err(Error::Validation("Score must be between 0 and 1".to_string()));
    }
    Ok(score)
}

/// Prediction ids end up in staging paths, object keys and callback URLs,
/// so they are restricted to `[A-Za-z0-9_-]`. UUIDs pass.
pub fn validate_prediction_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(Error::Validation("Missing prediction id".to_string()));
    }
    if uid.len() > 128 {
        return Err(Error::Validation("Prediction id too long (max 128)".to_string()));
    }
    if !uid
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!("Invalid prediction id: {:?}", uid)));
    }
    Ok(())
}

/// Fresh opaque identifier for a prediction session.
pub fn new_prediction_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_rejects_inverted_corners() {
        assert!(BoundingBox::new(10.0, 10.0, 50.0, 80.0).is_ok());
        assert!(BoundingBox::new(50.0, 10.0, 10.0, 80.0).is_err());
        assert!(BoundingBox::new(10.0, 80.0, 50.0, 10.0).is_err());
        assert!(BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_bounding_box_degenerate_is_valid() {
        let bbox = BoundingBox::new(5.0, 5.0, 5.0, 5.0).unwrap();
        assert_eq!(bbox.width(), 0.0);
        assert_eq!(bbox.height(), 0.0);
    }

    #[test]
    fn test_bounding_box_serializes_as_array() {
        let bbox = BoundingBox::new(10.0, 10.0, 50.0, 80.0).unwrap();
        let json = serde_json::to_string(&bbox).unwrap();
        assert_eq!(json, "[10.0,10.0,50.0,80.0]");

        let bad: std::result::Result<BoundingBox, _> = serde_json::from_str("[50.0,10.0,10.0,80.0]");
        assert!(bad.is_err());
    }

    #[test]
    fn test_detection_validation() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert!(Detection::new("person", 0.91, bbox).is_ok());
        assert!(Detection::new("person", 0.0, bbox).is_ok());
        assert!(Detection::new("person", 1.0, bbox).is_ok());
        assert!(Detection::new("", 0.5, bbox).is_err());
        assert!(Detection::new("   ", 0.5, bbox).is_err());
        assert!(Detection::new("person", 1.01, bbox).is_err());
        assert!(Detection::new("person", -0.01, bbox).is_err());
        assert!(Detection::new("person", f64::NAN, bbox).is_err());
        assert!(Detection::new("per\0son", 0.5, bbox).is_err());
        assert!(Detection::new("person\n", 0.5, bbox).is_err());
    }

    #[test]
    fn test_detection_json_uses_box_key() {
        let bbox = BoundingBox::new(1.0, 2.0, 3.0, 4.0).unwrap();
        let object = DetectionObject::new("abc", Detection::new("dog", 0.5, bbox).unwrap());
        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(value["predictionUid"], "abc");
        assert_eq!(value["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_image_extension_allow_list() {
        assert_eq!(image_extension("cat.jpg").unwrap(), ".jpg");
        assert_eq!(image_extension("cat.JPEG").unwrap(), ".jpeg");
        assert_eq!(image_extension("dir/cat.png").unwrap(), ".png");
        assert!(matches!(image_extension("notes.txt"), Err(Error::InvalidExtension(_))));
        assert!(matches!(image_extension("noext"), Err(Error::InvalidExtension(_))));
        assert!(matches!(image_extension("archive.png.zip"), Err(Error::InvalidExtension(_))));
    }

    #[test]
    fn test_image_kind_parse() {
        assert_eq!("original".parse::<ImageKind>().unwrap(), ImageKind::Original);
        assert_eq!("predicted".parse::<ImageKind>().unwrap(), ImageKind::Predicted);
        assert!("thumbnail".parse::<ImageKind>().is_err());
    }

    #[test]
    fn test_image_format_from_content_type() {
        assert_eq!(ImageFormat::from_content_type("image/png"), Some(ImageFormat::Png));
        assert_eq!(
            ImageFormat::from_content_type("image/jpeg; charset=binary"),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(ImageFormat::from_content_type("application/json"), None);
    }

    #[test]
    fn test_score_threshold_range() {
        assert!(validate_score(0.0).is_ok());
        assert!(validate_score(1.0).is_ok());
        assert!(validate_score(1.5).is_err());
        assert!(validate_score(-0.1).is_err());
    }

    #[test]
    fn test_prediction_uid_charset() {
        assert!(validate_prediction_uid(&new_prediction_uid()).is_ok());
        assert!(validate_prediction_uid("job_42-A").is_ok());
        for bad in ["", "../../x", "a/b", "a\\b", "..", "a.b", "a b", "a\0b", "a?b"] {
            assert!(validate_prediction_uid(bad).is_err(), "{:?} accepted", bad);
        }
        assert!(validate_prediction_uid(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_prediction_uids_are_unique() {
        assert_ne!(new_prediction_uid(), new_prediction_uid());
    }
}
