//! The prediction job state machine.
//!
//! ```text
//! Received -> Fetching -> Inferring -> Persisting -> [Notifying] -> Completed
//!     |           |           |            |
//!     +-----------+-----------+------------+------> Failed
//! ```
//!
//! Notifying only happens on the queue path, and a failed notification does
//! not fail the job.

use crate::context::ServiceContext;
use crate::gateway::ArtifactGateway;
use drishti_core::{image_extension, validate_prediction_uid, Detection, Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Received,
    Fetching,
    Inferring,
    Persisting,
    Notifying,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::Fetching => "fetching",
            JobState::Inferring => "inferring",
            JobState::Persisting => "persisting",
            JobState::Notifying => "notifying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: detect objects in the image at `image_source_ref`.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionJob {
    pub uid: String,
    pub image_source_ref: String,
    pub chat_id: Option<String>,
}

impl PredictionJob {
    /// Synchronous-path job with a fresh uid
    pub fn new(image_source_ref: impl Into<String>) -> Self {
        Self {
            uid: drishti_core::new_prediction_uid(),
            image_source_ref: image_source_ref.into(),
            chat_id: None,
        }
    }

    /// Required fields present, the uid is a safe token and the source has
    /// an allowed extension. Returns that extension.
    pub fn validate(&self) -> Result<String> {
        validate_prediction_uid(&self.uid)?;
        if self.image_source_ref.trim().is_empty() {
            return Err(Error::Validation("Missing image source reference".to_string()));
        }
        image_extension(&self.image_source_ref)
    }
}

/// Queue message body: `{predictionId, chatId, imageSourceRef}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub prediction_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub chat_id: Option<String>,
    pub image_source_ref: String,
}

impl QueueMessage {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| Error::Validation(format!("Malformed job message: {}", e)))
    }

    pub fn into_job(self) -> PredictionJob {
        PredictionJob {
            uid: self.prediction_id,
            image_source_ref: self.image_source_ref,
            chat_id: self.chat_id,
        }
    }
}

/// Chat ids arrive as strings or as bare integers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Outcome of a completed job
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub uid: String,
    pub original_image_ref: String,
    pub predicted_image_ref: String,
    pub detections: Vec<Detection>,
}

impl JobReport {
    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.detections.iter().map(|d| d.label.clone()).collect()
    }
}

/// Where a job stopped and why
#[derive(Debug, ThisError)]
#[error("job failed while {state}: {error}")]
pub struct JobFailure {
    pub state: JobState,
    #[source]
    pub error: Error,
}

impl JobFailure {
    pub fn into_error(self) -> Error {
        self.error
    }
}

#[derive(Debug, Clone, Copy)]
struct RunMode {
    notify: bool,
    /// A relational `AlreadyExists` means an earlier delivery committed
    tolerate_existing: bool,
}

struct Transitions<'a> {
    uid: &'a str,
    state: JobState,
}

impl<'a> Transitions<'a> {
    fn start(uid: &'a str) -> Self {
        debug!("Job {} {}", uid, JobState::Received);
        Self {
            uid,
            state: JobState::Received,
        }
    }

    fn advance(&mut self, next: JobState) {
        info!("Job {}: {} -> {}", self.uid, self.state, next);
        self.state = next;
    }

    fn fail(&self, error: Error) -> JobFailure {
        warn!("Job {}: {} -> {} ({})", self.uid, self.state, JobState::Failed, error);
        JobFailure {
            state: self.state,
            error,
        }
    }
}

#[derive(Clone)]
pub struct JobPipeline {
    ctx: ServiceContext,
}

impl JobPipeline {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    /// Inline execution for an HTTP request. No notification.
    pub async fn run_sync(&self, job: &PredictionJob) -> std::result::Result<JobReport, JobFailure> {
        self.run(
            job,
            RunMode {
                notify: false,
                tolerate_existing: false,
            },
        )
        .await
    }

    /// Execution for a queue delivery, which may be a redelivery.
    pub async fn run_queued(&self, job: &PredictionJob) -> std::result::Result<JobReport, JobFailure> {
        self.run(
            job,
            RunMode {
                notify: true,
                tolerate_existing: true,
            },
        )
        .await
    }

    async fn run(&self, job: &PredictionJob, mode: RunMode) -> std::result::Result<JobReport, JobFailure> {
        let mut t = Transitions::start(&job.uid);
        let ext = job.validate().map_err(|e| t.fail(e))?;

        t.advance(JobState::Fetching);
        let original = self
            .ctx
            .gateway
            .fetch(&job.uid, &job.image_source_ref)
            .await
            .map_err(|e| t.fail(as_fetch_failure(e)))?;

        t.advance(JobState::Inferring);
        let predicted_path = self.ctx.gateway.predicted_path(&job.uid, &ext);
        let detections = self
            .ctx
            .invoker
            .detect(&original, &predicted_path)
            .await
            .map_err(|e| t.fail(as_inference_failure(e)))?;

        t.advance(JobState::Persisting);
        let predicted_key = ArtifactGateway::predicted_key(&job.uid, &ext);
        let persisted_earlier = if mode.tolerate_existing {
            self.persisted_earlier(job)
                .await
                .map_err(|e| t.fail(as_persist_failure(e)))?
        } else {
            false
        };

        if persisted_earlier {
            info!("Job {} was already persisted by an earlier delivery", job.uid);
        } else {
            self.ctx
                .gateway
                .store(&predicted_path, &predicted_key)
                .await
                .map_err(|e| t.fail(as_persist_failure(e)))?;

            match self
                .ctx
                .store
                .save_prediction(&job.uid, &job.image_source_ref, &predicted_key, &detections)
                .await
            {
                Ok(()) => {}
                Err(Error::AlreadyExists(_)) if mode.tolerate_existing => {
                    info!("Job {} was persisted by a concurrent delivery", job.uid);
                }
                Err(e) => return Err(t.fail(as_persist_failure(e))),
            }
        }

        let report = JobReport {
            uid: job.uid.clone(),
            original_image_ref: job.image_source_ref.clone(),
            predicted_image_ref: predicted_key,
            detections,
        };

        if mode.notify {
            t.advance(JobState::Notifying);
            if let Err(e) = self
                .ctx
                .notifier
                .notify(&job.uid, job.chat_id.as_deref(), &report.labels())
                .await
            {
                error!("Job {}: completion callback failed: {}", job.uid, e);
            }
        }

        t.advance(JobState::Completed);
        Ok(report)
    }

    /// On a backend that rejects duplicate sessions, a stored session for
    /// the same uid and source means an earlier delivery committed. A stored
    /// session for another source is a conflict and nothing is overwritten.
    async fn persisted_earlier(&self, job: &PredictionJob) -> Result<bool> {
        if self.ctx.store.overwrites_sessions() {
            return Ok(false);
        }
        match self.ctx.store.get_session(&job.uid).await {
            Ok(existing) if existing.original_image_ref == job.image_source_ref => Ok(true),
            Ok(existing) => Err(Error::AlreadyExists(format!(
                "Prediction {} already exists for {}",
                job.uid, existing.original_image_ref
            ))),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn as_fetch_failure(error: Error) -> Error {
    match error {
        e @ (Error::FetchFailed(_) | Error::InvalidExtension(_) | Error::Validation(_)) => e,
        other => Error::FetchFailed(other.to_string()),
    }
}

fn as_inference_failure(error: Error) -> Error {
    match error {
        e @ Error::InferenceFailed(_) => e,
        other => Error::InferenceFailed(other.to_string()),
    }
}

fn as_persist_failure(error: Error) -> Error {
    match error {
        e @ Error::PersistFailed(_) => e,
        other => Error::PersistFailed(other.to_string()),
    }
}
