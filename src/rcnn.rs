//! ONNX Runtime backend: loads the exported Faster R-CNN and runs it.

use std::path::Path;
use std::sync::Mutex;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use tracing::{debug, info};

use crate::detection::RawDetections;
use crate::device::ComputeDevice;
use crate::error::{InferenceError, ModelLoadError};
use crate::preprocess::ImageTensor;
use crate::service::Detector;

const OUTPUT_BOXES: &str = "boxes";
const OUTPUT_LABELS: &str = "labels";
const OUTPUT_SCORES: &str = "scores";

/// Faster R-CNN exported to ONNX with a 3-class box predictor
/// (background, helmet, head).
///
/// The graph takes a single `[3, H, W]` image and returns `boxes` `[N, 4]`,
/// `labels` `[N]` and `scores` `[N]`.
pub struct FasterRcnn {
    session: Mutex<Session>,
    input_name: String,
}

/// Element type and rank of one graph input or output.
#[derive(Debug, Clone, PartialEq)]
struct TensorInfo {
    name: String,
    element: Option<TensorElementType>,
    rank: Option<usize>,
}

impl TensorInfo {
    fn new(name: &str, value_type: &ValueType) -> Self {
        Self {
            name: name.to_string(),
            element: value_type.tensor_type(),
            rank: value_type.tensor_shape().map(|shape| shape.len()),
        }
    }
}

/// Checks the graph signature against the detector contract and returns the
/// name of its single image input.
fn check_signature(inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Result<String, ModelLoadError> {
    let [input] = inputs else {
        return Err(ModelLoadError::Incompatible(format!(
            "expected exactly one input, found {}",
            inputs.len()
        )));
    };
    if input.element != Some(TensorElementType::Float32) || input.rank != Some(3) {
        return Err(ModelLoadError::Incompatible(format!(
            "input `{}` must be a rank-3 float32 tensor [3, H, W], found {:?} of rank {:?}",
            input.name, input.element, input.rank
        )));
    }

    let expected = [
        (OUTPUT_BOXES, TensorElementType::Float32, 2),
        (OUTPUT_LABELS, TensorElementType::Int64, 1),
        (OUTPUT_SCORES, TensorElementType::Float32, 1),
    ];
    for (name, element, rank) in expected {
        let output = outputs
            .iter()
            .find(|o| o.name == name)
            .ok_or_else(|| ModelLoadError::Incompatible(format!("missing output `{name}`")))?;
        if output.element != Some(element) || output.rank != Some(rank) {
            return Err(ModelLoadError::Incompatible(format!(
                "output `{name}` must be {element:?} of rank {rank}, found {:?} of rank {:?}",
                output.element, output.rank
            )));
        }
    }

    Ok(input.name.clone())
}

impl FasterRcnn {
    pub fn load(
        model_path: &Path,
        device: ComputeDevice,
        intra_threads: Option<usize>,
    ) -> Result<Self, ModelLoadError> {
        if !model_path.is_file() {
            return Err(ModelLoadError::MissingWeights(model_path.to_path_buf()));
        }

        let mut builder = Session::builder()
            .map_err(session_error)?
            .with_execution_providers(device.execution_providers())
            .map_err(session_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(session_error)?;
        if let Some(threads) = intra_threads {
            builder = builder.with_intra_threads(threads).map_err(session_error)?;
        }
        let session = builder.commit_from_file(model_path).map_err(session_error)?;

        let inputs: Vec<TensorInfo> = session
            .inputs
            .iter()
            .map(|i| TensorInfo::new(&i.name, &i.input_type))
            .collect();
        let outputs: Vec<TensorInfo> = session
            .outputs
            .iter()
            .map(|o| TensorInfo::new(&o.name, &o.output_type))
            .collect();
        let input_name = check_signature(&inputs, &outputs)?;

        debug!(
            "Model outputs: {:?}",
            session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
        );
        info!("Loaded Faster R-CNN from {} on {device}", model_path.display());

        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }
}

impl Detector for FasterRcnn {
    fn detect(&self, image: ImageTensor) -> Result<RawDetections, InferenceError> {
        let shape = image.shape().to_vec();
        let input = Tensor::from_array((shape, image.into_data())).map_err(runtime_error)?;

        let mut session = self.session.lock().map_err(|_| InferenceError::Poisoned)?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(runtime_error)?;

        // Output names and types were checked at load time.
        let (_, boxes) = outputs[OUTPUT_BOXES]
            .try_extract_tensor::<f32>()
            .map_err(runtime_error)?;
        let (_, labels) = outputs[OUTPUT_LABELS]
            .try_extract_tensor::<i64>()
            .map_err(runtime_error)?;
        let (_, scores) = outputs[OUTPUT_SCORES]
            .try_extract_tensor::<f32>()
            .map_err(runtime_error)?;

        if boxes.len() % 4 != 0 {
            return Err(InferenceError::MalformedOutput {
                name: OUTPUT_BOXES,
                reason: format!("{} values is not a whole number of boxes", boxes.len()),
            });
        }
        let boxes = boxes
            .chunks_exact(4)
            .map(|b| [b[0], b[1], b[2], b[3]])
            .collect();

        RawDetections::new(boxes, labels.to_vec(), scores.to_vec())
    }
}

fn session_error(e: impl std::fmt::Display) -> ModelLoadError {
    ModelLoadError::Session(e.to_string())
}

fn runtime_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::Runtime(e.to_string())
}
