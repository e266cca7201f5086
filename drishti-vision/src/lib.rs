//! Drishti vision: wraps the opaque object-detection capability.
//!
//! A [`Detector`] produces raw findings for an image on disk. The
//! [`InferenceInvoker`] normalizes them against a [`LabelVocabulary`] and
//! renders the annotated copy of the image.

pub mod annotate;
pub mod detector;
pub mod error;
pub mod invoker;
pub mod labels;

pub use annotate::annotate_image;
pub use detector::{CommandDetector, Detector, DisabledDetector, RawDetection};
pub use error::VisionError;
pub use invoker::{normalize_detections, InferenceInvoker};
pub use labels::{LabelVocabulary, COCO_CLASSES};
