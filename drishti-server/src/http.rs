use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use drishti_core::{
    image_extension, new_prediction_uid, validate_score, Error, ErrorKind, ImageFormat, ImageKind,
    PredictionSession, SessionSummary,
};
use drishti_pipeline::{JobPipeline, JobQueue, PredictionJob, QueueMessage, ServiceContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::negotiation::{format_of_key, negotiate_image};

/// Upper bound for raw image uploads
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

// API state
#[derive(Clone)]
pub struct ApiState {
    pub ctx: ServiceContext,
    pub pipeline: JobPipeline,
    /// Local job queue; `None` disables `POST /jobs`
    pub queue: Option<Arc<dyn JobQueue>>,
}

impl ApiState {
    pub fn new(ctx: ServiceContext, queue: Option<Arc<dyn JobQueue>>) -> Self {
        Self {
            pipeline: JobPipeline::new(ctx.clone()),
            ctx,
            queue,
        }
    }
}

// Response types
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictResponse {
    pub uid: String,
    pub detection_count: usize,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub prediction_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    #[serde(alias = "image_name")]
    image_name: Option<String>,
}

/// Every handler failure goes through here on its way to the client.
#[derive(Debug)]
pub enum ApiError {
    Domain(Error),
    Unavailable(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
            }
            ApiError::Domain(err) => {
                let status = match err.kind() {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Internal details stay in the logs.
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("Request failed: {}", err);
                    "An error occurred".to_string()
                } else {
                    err.to_string()
                };
                (status, message, err.code())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Create HTTP router with all API routes
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .route("/jobs", post(enqueue_job_handler))
        .route("/prediction/:uid", get(get_prediction_handler))
        .route("/prediction/:uid/image", get(get_prediction_image_handler))
        .route("/predictions/label/:label", get(predictions_by_label_handler))
        .route("/predictions/score/:min_score", get(predictions_by_score_handler))
        .route("/image/:kind/:filename", get(staged_image_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: state.ctx.store.backend_name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Accepts either `{"imageName": "<object key>"}` or a raw PNG/JPEG body.
async fn predict_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<PredictResponse>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let job = match ImageFormat::from_content_type(content_type) {
        Some(format) => {
            if body.is_empty() {
                return Err(Error::Validation("Empty image body".to_string()).into());
            }
            let uid = new_prediction_uid();
            let key = state.ctx.gateway.upload(&uid, format.extension(), body).await?;
            PredictionJob {
                uid,
                image_source_ref: key,
                chat_id: None,
            }
        }
        None => {
            let request: PredictRequest = serde_json::from_slice(&body)
                .map_err(|e| Error::Validation(format!("Invalid JSON body: {}", e)))?;
            let image_name = request
                .image_name
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| Error::Validation("Missing imageName in JSON body".to_string()))?;
            PredictionJob::new(image_name)
        }
    };

    let report = state
        .pipeline
        .run_sync(&job)
        .await
        .map_err(|failure| ApiError::from(failure.into_error()))?;

    info!(
        "Prediction {} finished with {} detections",
        report.uid,
        report.detection_count()
    );
    Ok(Json(PredictResponse {
        uid: report.uid.clone(),
        detection_count: report.detection_count(),
        labels: report.labels(),
    }))
}

/// Queue a job for the background consumer.
async fn enqueue_job_handler(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let queue = state
        .queue
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("Job queue is disabled".to_string()))?;

    let message = QueueMessage::parse(&String::from_utf8_lossy(&body))?;
    message.clone().into_job().validate()?;

    let payload = serde_json::to_string(&message).map_err(Error::from)?;
    queue.send(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            prediction_id: message.prediction_id,
        }),
    ))
}

async fn get_prediction_handler(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
) -> ApiResult<Json<PredictionSession>> {
    Ok(Json(state.ctx.store.get_session(&uid).await?))
}

async fn predictions_by_label_handler(
    State(state): State<ApiState>,
    Path(label): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    if !state.ctx.invoker.vocabulary().contains(&label) {
        return Err(Error::NotFound("Label not found".to_string()).into());
    }
    Ok(Json(state.ctx.store.list_sessions_by_label(&label).await?))
}

async fn predictions_by_score_handler(
    State(state): State<ApiState>,
    Path(min_score): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let min_score = min_score
        .parse::<f64>()
        .map_err(|_| Error::Validation(format!("Invalid score: {}", min_score)))?;
    validate_score(min_score)?;
    Ok(Json(state.ctx.store.list_sessions_by_score(min_score).await?))
}

async fn staged_image_handler(
    State(state): State<ApiState>,
    Path((kind, filename)): Path<(String, String)>,
) -> ApiResult<Response> {
    let kind: ImageKind = kind.parse()?;
    let path = state.ctx.gateway.staged(kind, &filename).await?;
    let data = tokio::fs::read(&path).await.map_err(Error::from)?;

    let content_type = match image_extension(&filename)?.as_str() {
        ".png" => ImageFormat::Png.content_type(),
        _ => ImageFormat::Jpeg.content_type(),
    };
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

/// Annotated image of a prediction in the format the client asks for.
async fn get_prediction_image_handler(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let key = state.ctx.store.get_predicted_image_ref(&uid).await?;

    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let format = negotiate_image(accept, format_of_key(&key))?;

    let data = match state.ctx.gateway.load(&key).await {
        Ok(data) => data,
        Err(Error::NotFound(_)) => {
            warn!("Prediction {} references missing image {}", uid, key);
            return Err(Error::NotFound("Predicted image file not found".to_string()).into());
        }
        Err(e) => return Err(e.into()),
    };

    Ok(([(header::CONTENT_TYPE, format.content_type())], data).into_response())
}
