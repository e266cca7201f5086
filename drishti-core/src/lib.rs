//! drishti-core: domain model, error taxonomy and configuration shared by
//! the storage, vision, pipeline and server crates.

pub mod types;
pub mod error;
pub mod config;

pub use error::{Error, ErrorKind, Result};
pub use types::{
    image_extension, new_prediction_uid, validate_prediction_uid, validate_score, BoundingBox, Detection,
    DetectionObject, ImageFormat, ImageKind, PredictionSession, SessionSummary,
    ALLOWED_EXTENSIONS,
};
pub use config::{AppConfig, ConfigError, StorageBackend};
