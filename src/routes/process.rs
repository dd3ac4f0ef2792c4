use crate::{
    frame::{FrameError, RgbFrame},
    input::{decode_upload, snapshot, CameraSource, InputError},
    processor::{ProcessedFrame, ProcessingError},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("Processing failed: {0}")]
    Processing(#[from] ProcessingError),
    #[error("Failed to encode result: {0}")]
    Encode(#[from] FrameError),
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Input(InputError::MalformedImage(_) | InputError::Frame(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Input(
                InputError::CameraUnavailable { .. }
                | InputError::CaptureFailed { .. }
                | InputError::OpenCv(_),
            ) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Processing(_) | ApiError::Encode(_) | ApiError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub original: String,
    pub annotated: String,
    pub caption: String,
    pub instances: usize,
}

fn png_data_uri(frame: &RgbFrame) -> Result<String, FrameError> {
    let png = frame.encode_png()?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

impl AnalysisResponse {
    fn new(original: &RgbFrame, processed: ProcessedFrame) -> Result<Self, FrameError> {
        Ok(Self {
            original: png_data_uri(original)?,
            annotated: png_data_uri(&processed.annotated)?,
            caption: processed.caption,
            instances: processed.instances,
        })
    }
}

/// Where the frame for one request comes from.
enum FrameSource {
    Upload(Bytes),
    Camera(CameraSource),
}

/// Acquires the frame and runs the pipeline as one blocking job. The
/// in-flight guard moves into the job, so it stays held until the work
/// finishes even if the client goes away.
async fn run_exclusive(
    state: &SharedState,
    route: &'static str,
    source: FrameSource,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let in_flight = state.in_flight.clone().lock_owned().await;
    let processor = state.processor.clone();
    let camera = state.camera.clone();
    let metrics = state.metrics.clone();

    let response = tokio::task::spawn_blocking(move || {
        let _in_flight = in_flight;
        let frame = match source {
            FrameSource::Upload(body) => decode_upload(&body)?,
            FrameSource::Camera(camera_source) => {
                snapshot(camera.as_ref(), camera_source).inspect_err(|_| {
                    metrics.record_camera_failure(camera_source.as_str());
                })?
            }
        };

        let started = Instant::now();
        let processed = processor.process(&frame)?;
        metrics.record_processing_duration(started.elapsed().as_millis() as u64, route);

        Ok::<_, ApiError>(AnalysisResponse::new(&frame, processed)?)
    })
    .await
    .map_err(|e| ApiError::Task(e.to_string()))??;

    Ok(Json(response))
}

#[instrument(skip(state, body), fields(bytes = body.len()))]
pub async fn upload_image(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<AnalysisResponse>, ApiError> {
    state.metrics.record_request("upload");
    run_exclusive(&state, "upload", FrameSource::Upload(body)).await
}

#[instrument(skip(state))]
pub async fn capture_frame(
    State(state): State<SharedState>,
    Path(camera): Path<CameraSource>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    state.metrics.record_request("capture");
    run_exclusive(&state, "capture", FrameSource::Camera(camera)).await
}
