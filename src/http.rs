//! HTTP surface: service info, health, prediction and the API description.

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::detection::Prediction;
use crate::error::ApiError;
use crate::service::InferenceService;

pub const SERVICE_TITLE: &str = "Helmet Detection API";

/// Shared router state. `None` means the model is not loaded.
#[derive(Clone, Default)]
pub struct AppState {
    inference: Option<Arc<InferenceService>>,
}

impl AppState {
    pub fn ready(service: InferenceService) -> Self {
        Self {
            inference: Some(Arc::new(service)),
        }
    }

    pub fn not_ready() -> Self {
        Self::default()
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/docs", get(docs))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": SERVICE_TITLE,
        "status": "active",
        "endpoints": {
            "health": "/health",
            "predict": "/predict (POST)",
            "docs": "/docs"
        }
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.inference.is_some(),
        device: state
            .inference
            .as_ref()
            .map_or_else(|| "not initialized".to_string(), |s| s.device().to_string()),
    })
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    status: &'static str,
    filename: Option<String>,
    #[serde(flatten)]
    prediction: Prediction,
}

struct Upload {
    filename: Option<String>,
    bytes: axum::body::Bytes,
}

async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let service = state.inference.as_ref().ok_or(ApiError::ModelNotReady)?;
    let mut multipart = multipart.map_err(|e| ApiError::Multipart(e.body_text()))?;
    let upload = read_upload(&mut multipart).await?;

    let prediction = service.predict(upload.bytes).await?;

    info!(
        "✅ {}: {}x{}, {} detections ({:?})",
        upload.filename.as_deref().unwrap_or("<unnamed>"),
        prediction.image_size.width,
        prediction.image_size.height,
        prediction.summary.total_detections,
        prediction.summary.safety_status,
    );

    Ok(Json(PredictResponse {
        status: "success",
        filename: upload.filename,
        prediction,
    }))
}

/// Pulls the `file` field out of the form, checking its declared type
/// before reading the body.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Multipart(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let is_image = field
            .content_type()
            .is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            return Err(ApiError::InvalidContentType);
        }

        let filename = field.file_name().map(str::to_owned);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Multipart(e.body_text()))?;
        return Ok(Upload { filename, bytes });
    }
    Err(ApiError::MissingFile)
}

async fn docs() -> Json<Value> {
    let error = json!({
        "type": "object",
        "properties": { "detail": { "type": "string" } }
    });
    let bbox = json!({
        "type": "object",
        "properties": {
            "x_min": { "type": "number" },
            "y_min": { "type": "number" },
            "x_max": { "type": "number" },
            "y_max": { "type": "number" }
        }
    });

    Json(json!({
        "openapi": "3.0.3",
        "info": {
            "title": SERVICE_TITLE,
            "description": "Detects helmets and bare heads in an uploaded image",
            "version": env!("CARGO_PKG_VERSION")
        },
        "paths": {
            "/": {
                "get": { "summary": "Service information", "responses": { "200": { "description": "Service metadata" } } }
            },
            "/health": {
                "get": {
                    "summary": "Health check",
                    "responses": {
                        "200": {
                            "description": "Model state",
                            "content": { "application/json": { "schema": {
                                "type": "object",
                                "properties": {
                                    "status": { "type": "string" },
                                    "model_loaded": { "type": "boolean" },
                                    "device": { "type": "string" }
                                }
                            } } }
                        }
                    }
                }
            },
            "/predict": {
                "post": {
                    "summary": "Detect helmets and bare heads",
                    "requestBody": {
                        "required": true,
                        "content": { "multipart/form-data": { "schema": {
                            "type": "object",
                            "required": ["file"],
                            "properties": { "file": { "type": "string", "format": "binary" } }
                        } } }
                    },
                    "responses": {
                        "200": {
                            "description": "Detections and safety summary",
                            "content": { "application/json": { "schema": {
                                "type": "object",
                                "properties": {
                                    "status": { "type": "string" },
                                    "filename": { "type": "string", "nullable": true },
                                    "image_size": {
                                        "type": "object",
                                        "properties": { "width": { "type": "integer" }, "height": { "type": "integer" } }
                                    },
                                    "detections": {
                                        "type": "array",
                                        "items": {
                                            "type": "object",
                                            "properties": {
                                                "class": { "type": "string", "enum": ["background", "helmet", "head", "unknown"] },
                                                "confidence": { "type": "number" },
                                                "bbox": bbox
                                            }
                                        }
                                    },
                                    "summary": {
                                        "type": "object",
                                        "properties": {
                                            "total_detections": { "type": "integer" },
                                            "helmet_count": { "type": "integer" },
                                            "head_without_helmet_count": { "type": "integer" },
                                            "safety_status": { "type": "string", "enum": ["SAFE", "UNSAFE"] }
                                        }
                                    }
                                }
                            } } }
                        },
                        "400": { "description": "Not an image, or unreadable upload", "content": { "application/json": { "schema": error.clone() } } },
                        "500": { "description": "Inference failure", "content": { "application/json": { "schema": error.clone() } } },
                        "503": { "description": "Model not loaded", "content": { "application/json": { "schema": error } } }
                    }
                }
            }
        }
    }))
}
