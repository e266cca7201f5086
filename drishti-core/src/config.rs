// Configuration for the drishti service

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    IoError(String),

    #[error("Config parse error: {0}")]
    ParseError(String),

    #[error("Config validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Configuration(err.to_string())
    }
}

/// Metadata store implementation, chosen once at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// SQLite tables joined on a foreign key
    Relational,
    /// Single partitioned table on sled
    WideColumn,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Relational => "relational",
            StorageBackend::WideColumn => "wide-column",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "sqlite" => Ok(StorageBackend::Relational),
            "wide-column" | "wide_column" | "widecolumn" | "dynamodb" | "sled" => {
                Ok(StorageBackend::WideColumn)
            }
            other => Err(ConfigError::ValidationError(format!(
                "Unsupported storage backend: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
    pub sled_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Relational,
            sqlite_path: PathBuf::from("./data/predictions.db"),
            sled_path: PathBuf::from("./data/predictions.sled"),
        }
    }
}

/// Object storage holding source and annotated images.
///
/// Without an `endpoint` the bucket is a directory below `root`; with one,
/// objects are addressed as `{endpoint}/{bucket}/{key}` over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub bucket: String,
    pub root: PathBuf,
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            bucket: "drishti-images".to_string(),
            root: PathBuf::from("./data/objects"),
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    /// Queue endpoint identifier
    pub name: String,
    /// Long-poll wait per receive
    pub wait_time_secs: u64,
    /// Sleep between empty polls
    pub idle_sleep_ms: u64,
    /// How long a received message stays hidden before redelivery
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "drishti-jobs".to_string(),
            wait_time_secs: 20,
            idle_sleep_ms: 500,
            visibility_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Completed queue jobs are reported to `{base_url}/predictions/{uid}`
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 10,
        }
    }
}

/// External detection program. `{input}` in `args` is replaced with the
/// staged image path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Overrides the default (COCO) label vocabulary
    pub labels: Option<Vec<String>>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["{input}".to_string()],
            labels: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub object_storage: ObjectStorageConfig,
    pub queue: QueueConfig,
    pub callback: CallbackConfig,
    pub inference: InferenceConfig,
    /// Local working area for original and predicted images
    pub staging_dir: PathBuf,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            object_storage: ObjectStorageConfig::default(),
            queue: QueueConfig::default(),
            callback: CallbackConfig::default(),
            inference: InferenceConfig::default(),
            staging_dir: PathBuf::from("./uploads"),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML or YAML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        if path.contains("..") {
            return Err(ConfigError::IoError(format!(
                "Path traversal detected: '{}'",
                path
            )));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path, e)))?;

        if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
        } else if path.ends_with(".toml") {
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
        } else {
            Self::from_str(&content)
        }
    }

    /// Parse configuration, trying TOML first and then YAML
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = toml::from_str::<AppConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = serde_yaml::from_str::<AppConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError("Unknown format".to_string()))
    }

    /// Apply environment overrides on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(*k));

        if let Some(backend) = first(&["DRISHTI_STORAGE_BACKEND", "STORAGE_TYPE"]) {
            self.storage.backend = backend.parse()?;
        }
        if let Some(path) = lookup("DRISHTI_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("DRISHTI_SLED_PATH") {
            self.storage.sled_path = PathBuf::from(path);
        }
        if let Some(bucket) = first(&["DRISHTI_BUCKET", "S3_BUCKET_NAME"]) {
            self.object_storage.bucket = bucket;
        }
        if let Some(endpoint) = lookup("DRISHTI_OBJECT_ENDPOINT") {
            self.object_storage.endpoint = Some(endpoint);
        }
        if let Some(queue) = lookup("DRISHTI_QUEUE") {
            self.queue.name = queue;
        }
        if let Some(base) = lookup("DRISHTI_CALLBACK_BASE") {
            self.callback.base_url = Some(base);
        }
        if let Some(port) = lookup("DRISHTI_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::ParseError(format!("Invalid DRISHTI_PORT: {}", port)))?;
        }
        if let Some(host) = lookup("DRISHTI_HOST") {
            self.server.host = host;
        }
        if let Some(command) = lookup("DRISHTI_DETECTOR_COMMAND") {
            self.inference.command = Some(command);
        }
        if let Some(level) = lookup("DRISHTI_LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_storage.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "object_storage.bucket must not be empty".to_string(),
            ));
        }

        if self.object_storage.bucket.contains('/') || self.object_storage.bucket.contains("..") {
            return Err(ConfigError::ValidationError(format!(
                "object_storage.bucket is not a valid bucket name: {}",
                self.object_storage.bucket
            )));
        }

        if let Some(endpoint) = &self.object_storage.endpoint {
            if !is_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "object_storage.endpoint must be an http(s) URL: {}",
                    endpoint
                )));
            }
        }

        if let Some(base) = &self.callback.base_url {
            if !is_http_url(base) {
                return Err(ConfigError::ValidationError(format!(
                    "callback.base_url must be an http(s) URL: {}",
                    base
                )));
            }
        }

        if self.queue.enabled {
            if self.queue.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "queue.name must not be empty".to_string(),
                ));
            }
            if self.queue.visibility_timeout_secs == 0 {
                return Err(ConfigError::ValidationError(
                    "queue.visibility_timeout_secs must be > 0".to_string(),
                ));
            }
        }

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be > 0".to_string(),
            ));
        }

        if let Some(labels) = &self.inference.labels {
            if labels.is_empty() || labels.iter().any(|l| l.trim().is_empty()) {
                return Err(ConfigError::ValidationError(
                    "inference.labels must be non-empty strings".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
