//! Object storage holding source and annotated image bytes.

use async_trait::async_trait;
use bytes::Bytes;
use drishti_core::config::ObjectStorageConfig;
use drishti_core::{Error, Result};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Flat key/value blob storage within one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Fails with [`Error::NotFound`] when the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Keys are relative, slash separated and never climb out of the bucket.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("Object key must not be empty".to_string()));
    }
    if key.starts_with('/') || key.contains('\\') || key.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(format!("Invalid object key: {}", key)));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(Error::Validation(format!("Invalid object key: {}", key)));
    }
    Ok(())
}

/// Open the object store described by the configuration: HTTP when an
/// endpoint is set, a local directory otherwise.
pub fn open_object_store(config: &ObjectStorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match &config.endpoint {
        Some(endpoint) => {
            info!("Using HTTP object store {} (bucket {})", endpoint, config.bucket);
            Ok(Arc::new(HttpObjectStore::new(
                endpoint,
                &config.bucket,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        None => {
            info!("Using local object store under {:?} (bucket {})", config.root, config.bucket);
            Ok(Arc::new(LocalObjectStore::new(&config.root, &config.bucket)))
        }
    }
}

/// A bucket is a directory under `root`.
pub struct LocalObjectStore {
    bucket: String,
    dir: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            dir: root.as_ref().join(bucket),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Object {}/{}", self.bucket, key)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        debug!("Stored {} bytes at {:?}", data.len(), path);
        Ok(())
    }
}

/// S3-style HTTP object storage: `GET`/`PUT {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, bucket: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        })
    }

    fn url_for(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/{}/{}",
            self.endpoint,
            urlencoding::encode(&self.bucket),
            path
        ))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let url = self.url_for(key)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("GET {} failed: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|e| Error::Storage(format!("GET {} body: {}", url, e))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("Object {}/{}", self.bucket, key))),
            status => Err(Error::Storage(format!("GET {} returned {}", url, status.as_u16()))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let url = self.url_for(key)?;
        let response = self
            .client
            .put(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("PUT {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "PUT {} returned {}",
                url,
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("cat.jpg").is_ok());
        assert!(validate_key("predicted/abc.png").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("../secret.png").is_err());
        assert!(validate_key("a//b.png").is_err());
        assert!(validate_key("a\\b.png").is_err());
    }

    #[tokio::test]
    async fn test_local_store_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "bucket");
        store.put("predicted/a.png", Bytes::from_static(b"png")).await.unwrap();

        assert_eq!(store.get("predicted/a.png").await.unwrap(), Bytes::from_static(b"png"));
        assert!(dir.path().join("bucket/predicted/a.png").exists());
        assert!(matches!(store.get("missing.png").await, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_http_store_urls() {
        let store = HttpObjectStore::new("http://minio:9000/", "images", Duration::from_secs(1)).unwrap();
        assert_eq!(store.url_for("a/b.jpg").unwrap(), "http://minio:9000/images/a/b.jpg");
        assert!(store.url_for("../b.jpg").is_err());
    }

    #[test]
    fn test_http_store_urls_encode_segments() {
        let store = HttpObjectStore::new("http://minio:9000", "images", Duration::from_secs(1)).unwrap();
        let url = store.url_for("in/my#cat?.jpg").unwrap();
        assert_eq!(url, "http://minio:9000/images/in/my%23cat%3F.jpg");

        let parsed = reqwest::Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/images/in/my%23cat%3F.jpg");
        assert_eq!(parsed.fragment(), None);
        assert_eq!(parsed.query(), None);

        assert_eq!(
            store.url_for("in/100% real.png").unwrap(),
            "http://minio:9000/images/in/100%25%20real.png"
        );
    }
}
