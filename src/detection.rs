//! Detection records, the confidence filter and the safety summary.

use serde::Serialize;

use crate::error::InferenceError;
use crate::preprocess::ImageSize;

/// Minimum score for a detection to be reported. Inclusive.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionClass {
    Background,
    Helmet,
    Head,
    Unknown,
}

impl DetectionClass {
    /// Fixed label table of the 3-class head: 0 background, 1 helmet, 2 head.
    pub fn from_label(label: i64) -> Self {
        match label {
            0 => DetectionClass::Background,
            1 => DetectionClass::Helmet,
            2 => DetectionClass::Head,
            _ => DetectionClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x_min, y_min, x_max, y_max]: [f32; 4]) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class: DetectionClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Index-aligned model output for one image, in the model's native order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
    boxes: Vec<[f32; 4]>,
    labels: Vec<i64>,
    scores: Vec<f32>,
}

impl RawDetections {
    /// # Errors
    ///
    /// Returns [`InferenceError::Misaligned`] unless all three sequences
    /// have the same length.
    pub fn new(
        boxes: Vec<[f32; 4]>,
        labels: Vec<i64>,
        scores: Vec<f32>,
    ) -> Result<Self, InferenceError> {
        if boxes.len() != labels.len() || labels.len() != scores.len() {
            return Err(InferenceError::Misaligned {
                boxes: boxes.len(),
                labels: labels.len(),
                scores: scores.len(),
            });
        }
        Ok(Self {
            boxes,
            labels,
            scores,
        })
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Keeps entries scoring at least [`CONFIDENCE_THRESHOLD`] and names
    /// their class. Background is not filtered out.
    pub fn above_threshold(&self) -> Vec<Detection> {
        self.boxes
            .iter()
            .zip(&self.labels)
            .zip(&self.scores)
            .filter(|(_, &score)| score >= CONFIDENCE_THRESHOLD)
            .map(|((&bbox, &label), &score)| Detection {
                class: DetectionClass::from_label(label),
                confidence: score,
                bbox: bbox.into(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyStatus {
    Safe,
    Unsafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_detections: usize,
    pub helmet_count: usize,
    pub head_without_helmet_count: usize,
    pub safety_status: SafetyStatus,
}

impl Summary {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let count = |class| detections.iter().filter(|d| d.class == class).count();
        let helmet_count = count(DetectionClass::Helmet);
        let head_without_helmet_count = count(DetectionClass::Head);

        Self {
            total_detections: detections.len(),
            helmet_count,
            head_without_helmet_count,
            safety_status: if head_without_helmet_count == 0 {
                SafetyStatus::Safe
            } else {
                SafetyStatus::Unsafe
            },
        }
    }
}

/// Everything the service knows about one processed upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub image_size: ImageSize,
    pub detections: Vec<Detection>,
    pub summary: Summary,
}

impl Prediction {
    pub fn from_raw(image_size: ImageSize, raw: &RawDetections) -> Self {
        let detections = raw.above_threshold();
        let summary = Summary::from_detections(&detections);
        Self {
            image_size,
            detections,
            summary,
        }
    }
}
