//! Artifact gateway: moves image bytes between object storage and the
//! local staging area.
//!
//! Staging layout, always derived from the job uid:
//!
//! ```text
//! <staging>/original/<uid><ext>
//! <staging>/predicted/<uid><ext>
//! ```

use crate::object_store::ObjectStore;
use bytes::Bytes;
use drishti_core::{image_extension, validate_prediction_uid, Error, ImageKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct ArtifactGateway {
    store: Arc<dyn ObjectStore>,
    staging_dir: PathBuf,
}

impl ArtifactGateway {
    pub fn new(store: Arc<dyn ObjectStore>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    pub fn original_path(&self, uid: &str, ext: &str) -> PathBuf {
        self.staging_dir
            .join(ImageKind::Original.as_str())
            .join(format!("{}{}", uid, ext))
    }

    pub fn predicted_path(&self, uid: &str, ext: &str) -> PathBuf {
        self.staging_dir
            .join(ImageKind::Predicted.as_str())
            .join(format!("{}{}", uid, ext))
    }

    /// Object key of the annotated image
    pub fn predicted_key(uid: &str, ext: &str) -> String {
        format!("predicted/{}{}", uid, ext)
    }

    /// Download `remote_key` into the original staging slot for `uid`.
    /// The extension is checked before any network call.
    pub async fn fetch(&self, uid: &str, remote_key: &str) -> Result<PathBuf> {
        validate_prediction_uid(uid)?;
        let ext = image_extension(remote_key)?;
        let data = self
            .store
            .get(remote_key)
            .await
            .map_err(|e| Error::FetchFailed(format!("{}: {}", remote_key, e)))?;

        let path = self.original_path(uid, &ext);
        write_staged(&path, &data)
            .await
            .map_err(|e| Error::FetchFailed(format!("staging {:?}: {}", path, e)))?;
        debug!("Fetched {} ({} bytes) to {:?}", remote_key, data.len(), path);
        Ok(path)
    }

    /// Upload a local file to `remote_key`
    pub async fn store(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| Error::StoreFailed(format!("reading {:?}: {}", local_path, e)))?;
        self.store
            .put(remote_key, Bytes::from(data))
            .await
            .map_err(|e| Error::StoreFailed(format!("{}: {}", remote_key, e)))?;
        debug!("Stored {:?} as {}", local_path, remote_key);
        Ok(())
    }

    /// Raw bytes of a stored object; `NotFound` passes through.
    pub async fn load(&self, remote_key: &str) -> Result<Bytes> {
        self.store.get(remote_key).await
    }

    /// Store an uploaded image under `uploads/<uid><ext>` and return its key
    pub async fn upload(&self, uid: &str, ext: &str, data: Bytes) -> Result<String> {
        validate_prediction_uid(uid)?;
        let key = format!("uploads/{}{}", uid, image_extension(&format!("{}{}", uid, ext))?);
        self.store
            .put(&key, data)
            .await
            .map_err(|e| Error::StoreFailed(format!("{}: {}", key, e)))?;
        Ok(key)
    }

    /// Path of a file in the staging area. `filename` must be a bare file
    /// name with an allowed image extension.
    pub async fn staged(&self, kind: ImageKind, filename: &str) -> Result<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.starts_with('.')
        {
            return Err(Error::Validation(format!("Invalid file name: {}", filename)));
        }
        image_extension(filename)?;

        let path = self.staging_dir.join(kind.as_str()).join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(Error::NotFound("Image not found".to_string())),
        }
    }
}

async fn write_staged(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::LocalObjectStore;

    fn gateway(dir: &Path) -> ArtifactGateway {
        let store = Arc::new(LocalObjectStore::new(dir.join("objects"), "bucket"));
        ArtifactGateway::new(store, dir.join("uploads"))
    }

    #[tokio::test]
    async fn test_fetch_stages_by_uid() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        gw.store.put("in/cat.JPG", Bytes::from_static(b"jpeg")).await.unwrap();

        let path = gw.fetch("abc", "in/cat.JPG").await.unwrap();
        assert_eq!(path, dir.path().join("uploads/original/abc.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        assert!(matches!(gw.fetch("abc", "notes.txt").await, Err(Error::InvalidExtension(_))));
        assert!(matches!(gw.fetch("abc", "missing.png").await, Err(Error::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_fetch_rejects_unsafe_uid() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        gw.store.put("in/cat.jpg", Bytes::from_static(b"jpeg")).await.unwrap();

        assert!(matches!(
            gw.fetch("../../escaped", "in/cat.jpg").await,
            Err(Error::Validation(_))
        ));
        assert!(!dir.path().join("escaped.jpg").exists());
        assert!(gw.upload("../x", ".png", Bytes::from_static(b"png")).await.is_err());
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let local = gw.predicted_path("abc", ".png");
        write_staged(&local, b"annotated").await.unwrap();

        let key = ArtifactGateway::predicted_key("abc", ".png");
        gw.store(&local, &key).await.unwrap();
        assert_eq!(gw.load(&key).await.unwrap(), Bytes::from_static(b"annotated"));
        assert!(matches!(gw.load("predicted/none.png").await, Err(Error::NotFound(_))));
        assert!(matches!(
            gw.store(&dir.path().join("nope.png"), "x.png").await,
            Err(Error::StoreFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_key() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let key = gw.upload("abc", ".png", Bytes::from_static(b"png")).await.unwrap();
        assert_eq!(key, "uploads/abc.png");
        assert!(gw.upload("abc", ".gif", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_staged_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        write_staged(&gw.original_path("abc", ".jpg"), b"x").await.unwrap();

        assert!(gw.staged(ImageKind::Original, "abc.jpg").await.is_ok());
        assert!(matches!(
            gw.staged(ImageKind::Predicted, "abc.jpg").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            gw.staged(ImageKind::Original, "../original/abc.jpg").await,
            Err(Error::Validation(_))
        ));
        assert!(gw.staged(ImageKind::Original, "abc.txt").await.is_err());
    }
}
