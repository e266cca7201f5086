pub mod metadata_store;
pub mod relational;
pub mod wide_column;

pub use metadata_store::MetadataStore;
pub use relational::RelationalStore;
pub use wide_column::WideColumnStore;

use drishti_core::{config::StorageConfig, Result, StorageBackend};
use std::sync::Arc;
use tracing::info;

/// Open the metadata store selected by configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match config.backend {
        StorageBackend::Relational => Arc::new(RelationalStore::open(&config.sqlite_path)?),
        StorageBackend::WideColumn => Arc::new(WideColumnStore::open(&config.sled_path)?),
    };
    info!("Metadata store ready (backend: {})", store.backend_name());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_store_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig {
            backend: StorageBackend::Relational,
            sqlite_path: dir.path().join("meta.db"),
            sled_path: dir.path().join("meta.sled"),
        };

        let store = open_store(&config).unwrap();
        assert_eq!(store.backend_name(), "relational");
        assert!(!store.overwrites_sessions());

        config.backend = StorageBackend::WideColumn;
        let store = open_store(&config).unwrap();
        assert_eq!(store.backend_name(), "wide-column");
        assert!(store.overwrites_sessions());
    }
}
