//! Helmet / bare-head detection served over HTTP.
//!
//! A Faster R-CNN exported to ONNX is loaded once at startup and wrapped in an
//! [`service::InferenceService`]. Each `POST /predict` decodes the upload,
//! runs the model on tokio's blocking pool, keeps detections scoring at least
//! 0.5 and derives a SAFE / UNSAFE verdict from the number of bare heads.

pub mod config;
pub mod detection;
pub mod device;
pub mod error;
pub mod http;
pub mod preprocess;
pub mod rcnn;
pub mod service;

pub use detection::{Detection, DetectionClass, Prediction, RawDetections, SafetyStatus, Summary};
pub use error::{ApiError, DecodeError, InferenceError, ModelLoadError, PredictError};
pub use http::{router, AppState};
pub use service::{Detector, InferenceLimits, InferenceService};
