//! Collaborators shared by the pipeline and the HTTP surface.

use crate::gateway::ArtifactGateway;
use crate::notifier::{notifier_from_config, CallbackNotifier};
use crate::object_store::open_object_store;
use drishti_core::{AppConfig, Result};
use drishti_storage::{open_store, MetadataStore};
use drishti_vision::InferenceInvoker;
use std::sync::Arc;

/// Built once at startup and cloned into every task that needs it.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn MetadataStore>,
    pub gateway: Arc<ArtifactGateway>,
    pub invoker: Arc<InferenceInvoker>,
    pub notifier: Arc<dyn CallbackNotifier>,
}

impl ServiceContext {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        gateway: Arc<ArtifactGateway>,
        invoker: Arc<InferenceInvoker>,
        notifier: Arc<dyn CallbackNotifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            invoker,
            notifier,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        let objects = open_object_store(&config.object_storage)?;
        let gateway = Arc::new(ArtifactGateway::new(objects, config.staging_dir.clone()));
        let invoker = Arc::new(InferenceInvoker::from_config(&config.inference)?);
        let notifier = notifier_from_config(&config.callback)?;
        Ok(Self::new(store, gateway, invoker, notifier))
    }
}
