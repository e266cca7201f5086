use async_trait::async_trait;
use drishti_core::{Detection, Error, PredictionSession, Result, SessionSummary};

/// Durable record of prediction sessions and their detections.
///
/// Two backends implement this trait and must return the same logical
/// result sets for the same writes. They deliberately differ on duplicate
/// session writes, see [`MetadataStore::overwrites_sessions`].
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Short backend identifier used in logs and health output
    fn backend_name(&self) -> &'static str;

    /// Whether a second `save_session` for the same uid overwrites the first
    /// (last-write-wins) instead of failing with [`Error::AlreadyExists`].
    ///
    /// Relational: `false`, primary-key insert. Wide-column: `true`, upsert.
    fn overwrites_sessions(&self) -> bool;

    /// Record a new prediction session
    async fn save_session(&self, uid: &str, original_ref: &str, predicted_ref: &str) -> Result<()>;

    /// Attach one detection to an existing session.
    /// Fails with [`Error::SessionNotFound`] if the session was never written.
    async fn save_detection(&self, uid: &str, detection: &Detection) -> Result<()>;

    /// Session with all its detections in insertion order
    async fn get_session(&self, uid: &str) -> Result<PredictionSession>;

    /// Sessions with at least one detection carrying `label`. Order is unspecified.
    async fn list_sessions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>>;

    /// Sessions with at least one detection scoring `>= min_score`. Order is unspecified.
    async fn list_sessions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>>;

    /// Storage key of the annotated image
    async fn get_predicted_image_ref(&self, uid: &str) -> Result<String>;

    /// Write a session and all its detections, session first.
    ///
    /// The default performs separate writes and can leave a session with
    /// only part of its detections if interrupted. Backends override it
    /// with a single atomic batch.
    async fn save_prediction(
        &self,
        uid: &str,
        original_ref: &str,
        predicted_ref: &str,
        detections: &[Detection],
    ) -> Result<()> {
        self.save_session(uid, original_ref, predicted_ref).await?;
        for detection in detections {
            self.save_detection(uid, detection).await?;
        }
        Ok(())
    }
}

/// Session identifiers end up inside composite keys.
pub(crate) fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(Error::Validation("Prediction uid must not be empty".to_string()));
    }
    if uid.len() > 256 {
        return Err(Error::Validation("Prediction uid too long (max 256)".to_string()));
    }
    if uid.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "Prediction uid contains control characters".to_string(),
        ));
    }
    Ok(())
}
