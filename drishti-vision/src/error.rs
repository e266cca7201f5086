//! Error types for drishti-vision

use drishti_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Invalid detector output: {0}")]
    Output(String),

    #[error("Annotation error: {0}")]
    Annotation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Config(msg) => CoreError::Configuration(msg),
            other => CoreError::InferenceFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::Detector("exit status 1".to_string());
        assert!(err.to_string().contains("Detector error"));
        assert!(err.to_string().contains("exit status 1"));
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        assert!(matches!(vision_err, VisionError::Io(_)));
    }

    #[test]
    fn test_vision_error_to_core_error() {
        let core_err: CoreError = VisionError::Output("not json".to_string()).into();
        match core_err {
            CoreError::InferenceFailed(msg) => assert!(msg.contains("not json")),
            other => panic!("Expected InferenceFailed, got {:?}", other),
        }

        let core_err: CoreError = VisionError::Config("no command".to_string()).into();
        assert!(matches!(core_err, CoreError::Configuration(_)));
    }
}
