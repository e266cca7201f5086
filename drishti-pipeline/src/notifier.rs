//! Completion callbacks for queue-triggered jobs.

use async_trait::async_trait;
use drishti_core::config::CallbackConfig;
use drishti_core::{Error, Result};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub chat_id: Option<String>,
    pub labels: Vec<String>,
}

/// Best-effort report of a finished job to an external system.
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn notify(&self, uid: &str, chat_id: Option<&str>, labels: &[String]) -> Result<()>;
}

pub fn notifier_from_config(config: &CallbackConfig) -> Result<Arc<dyn CallbackNotifier>> {
    match &config.base_url {
        Some(base) => {
            info!("Completion callbacks go to {}", base);
            Ok(Arc::new(HttpCallbackNotifier::new(
                base,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}

/// `POST {base}/predictions/{uid}` with `{chatId, labels}`
pub struct HttpCallbackNotifier {
    client: Client,
    base_url: String,
}

impl HttpCallbackNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, uid: &str) -> String {
        format!("{}/predictions/{}", self.base_url, urlencoding::encode(uid))
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, uid: &str, chat_id: Option<&str>, labels: &[String]) -> Result<()> {
        let url = self.url_for(uid);
        let payload = CallbackPayload {
            chat_id: chat_id.map(str::to_string),
            labels: labels.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::NotifyFailed(format!("POST {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::NotifyFailed(format!(
                "POST {} returned {}",
                url,
                response.status().as_u16()
            )));
        }
        debug!("Callback delivered for {}", uid);
        Ok(())
    }
}

/// Used when no callback endpoint is configured
pub struct NoopNotifier;

#[async_trait]
impl CallbackNotifier for NoopNotifier {
    async fn notify(&self, uid: &str, _chat_id: Option<&str>, _labels: &[String]) -> Result<()> {
        debug!("No callback configured, skipping notification for {}", uid);
        Ok(())
    }
}
