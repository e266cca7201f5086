use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid image file extension: {0}")]
    InvalidExtension(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Prediction session not found: {0}")]
    SessionNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Store failed: {0}")]
    StoreFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Persist failed: {0}")]
    PersistFailed(String),

    #[error("Notify failed: {0}")]
    NotifyFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the transport layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NotAcceptable,
    Conflict,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidExtension(_) => ErrorKind::Validation,
            Error::NotFound(_) | Error::SessionNotFound(_) => ErrorKind::NotFound,
            Error::NotAcceptable(_) => ErrorKind::NotAcceptable,
            Error::AlreadyExists(_) => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }

    /// Short machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidExtension(_) => "INVALID_EXTENSION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::NotAcceptable(_) => "NOT_ACCEPTABLE",
            Error::FetchFailed(_) => "FETCH_FAILED",
            Error::StoreFailed(_) => "STORE_FAILED",
            Error::InferenceFailed(_) => "INFERENCE_FAILED",
            Error::PersistFailed(_) => "PERSIST_FAILED",
            Error::NotifyFailed(_) => "NOTIFY_FAILED",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Configuration(_) => "CONFIGURATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
