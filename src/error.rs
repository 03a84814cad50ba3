//! Error types for model loading, the request pipeline and the HTTP layer.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::device::ComputeDevice;

/// Fatal startup error. The service must not serve predictions after one.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("weights file not found: {}", .0.display())]
    MissingWeights(PathBuf),

    #[error("requested device `{0}` is not available")]
    DeviceUnavailable(ComputeDevice),

    #[error("failed to build inference session: {0}")]
    Session(String),

    #[error("model graph is incompatible: {0}")]
    Incompatible(String),
}

/// The uploaded bytes are not an image we can read.
#[derive(Debug, Error)]
#[error("cannot decode image: {0}")]
pub struct DecodeError(#[from] pub image::ImageError);

/// Failure inside the forward pass or while reading its outputs.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference runtime error: {0}")]
    Runtime(String),

    #[error("model output `{name}` is malformed: {reason}")]
    MalformedOutput { name: &'static str, reason: String },

    #[error("misaligned detections: {boxes} boxes, {labels} labels, {scores} scores")]
    Misaligned {
        boxes: usize,
        labels: usize,
        scores: usize,
    },

    #[error("model session lock is poisoned")]
    Poisoned,
}

/// Failure of one prediction request inside the inference service.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("inference timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("inference worker failed: {0}")]
    Worker(String),

    #[error("inference pool is closed")]
    PoolClosed,
}

/// Errors surfaced to HTTP clients as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Model not loaded")]
    ModelNotReady,

    #[error("Invalid file type. Please upload an image file.")]
    InvalidContentType,

    #[error("missing multipart field `file`")]
    MissingFile,

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error(transparent)]
    Predict(#[from] PredictError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ModelNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidContentType | ApiError::MissingFile | ApiError::Multipart(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Predict(PredictError::Decode(_)) => StatusCode::BAD_REQUEST,
            ApiError::Predict(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!("❌ {} ({})", self, status.as_u16());
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_faults_map_to_4xx() {
        assert_eq!(ApiError::InvalidContentType.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingFile.status_code(), StatusCode::BAD_REQUEST);
        let decode = image::load_from_memory(b"not an image").unwrap_err();
        let err = ApiError::from(PredictError::from(DecodeError(decode)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn server_faults_map_to_5xx() {
        assert_eq!(ApiError::ModelNotReady.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let err = ApiError::from(PredictError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = ApiError::from(PredictError::from(InferenceError::Poisoned));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
