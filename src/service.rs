//! The inference service: one immutable handle built at startup and shared
//! by every request.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::detection::{Prediction, RawDetections};
use crate::device::{self, ComputeDevice, DevicePreference};
use crate::error::{InferenceError, ModelLoadError, PredictError};
use crate::preprocess::{self, ImageTensor};
use crate::rcnn::FasterRcnn;

/// A read-only forward pass over one preprocessed image.
///
/// Implementations must be safe to call from several blocking threads at
/// once and must not change the model between calls.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: ImageTensor) -> Result<RawDetections, InferenceError>;
}

/// Admission limits for the blocking inference pool.
#[derive(Debug, Clone, Copy)]
pub struct InferenceLimits {
    pub max_concurrent: usize,
    /// Covers waiting for a slot plus the inference itself.
    pub timeout: Duration,
}

impl Default for InferenceLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct InferenceService {
    detector: Arc<dyn Detector>,
    device: ComputeDevice,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl InferenceService {
    pub fn new(detector: Arc<dyn Detector>, device: ComputeDevice, limits: InferenceLimits) -> Self {
        Self {
            detector,
            device,
            permits: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            timeout: limits.timeout,
        }
    }

    /// Selects a device and loads the Faster R-CNN weights onto it.
    ///
    /// # Errors
    ///
    /// Any [`ModelLoadError`]; callers should abort startup.
    pub fn load(
        model_path: &Path,
        preference: DevicePreference,
        intra_threads: Option<usize>,
        limits: InferenceLimits,
    ) -> Result<Self, ModelLoadError> {
        let device = device::select_device(preference)?;
        let model = FasterRcnn::load(model_path, device, intra_threads)?;
        Ok(Self::new(Arc::new(model), device, limits))
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    /// Decodes, runs the detector and formats the result off the async
    /// executor.
    ///
    /// If the timeout fires the blocking task keeps running to completion and
    /// keeps its slot until then.
    pub async fn predict<B>(&self, image_bytes: B) -> Result<Prediction, PredictError>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let detector = Arc::clone(&self.detector);
        let permits = Arc::clone(&self.permits);

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| PredictError::PoolClosed)?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_pipeline(detector.as_ref(), image_bytes.as_ref())
            })
            .await
            .map_err(|e| PredictError::Worker(e.to_string()))?
        };

        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| PredictError::Timeout(self.timeout))?
    }
}

fn run_pipeline(detector: &dyn Detector, image_bytes: &[u8]) -> Result<Prediction, PredictError> {
    let image = preprocess::decode(image_bytes)?;
    let tensor = ImageTensor::from_image(image);
    let size = tensor.size();
    debug!("Running detector on {}x{} image", size.width, size.height);

    let raw = detector.detect(tensor)?;
    debug!("Detector returned {} raw detections", raw.len());
    Ok(Prediction::from_raw(size, &raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::SafetyStatus;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(RawDetections);

    impl Detector for Fixed {
        fn detect(&self, _image: ImageTensor) -> Result<RawDetections, InferenceError> {
            Ok(self.0.clone())
        }
    }

    struct Slow {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Detector for Slow {
        fn detect(&self, _image: ImageTensor) -> Result<RawDetections, InferenceError> {
            std::thread::sleep(self.delay);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawDetections::default())
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn predict_reports_original_size() {
        let raw = RawDetections::new(vec![[1.0, 2.0, 3.0, 4.0]], vec![1], vec![0.9]).unwrap();
        let service = InferenceService::new(
            Arc::new(Fixed(raw)),
            ComputeDevice::Cpu,
            InferenceLimits::default(),
        );

        let prediction = service.predict(png(7, 3)).await.unwrap();
        assert_eq!((prediction.image_size.width, prediction.image_size.height), (7, 3));
        assert_eq!(prediction.summary.helmet_count, 1);
        assert_eq!(prediction.summary.safety_status, SafetyStatus::Safe);
    }

    #[tokio::test]
    async fn undecodable_bytes_are_a_decode_error() {
        let service = InferenceService::new(
            Arc::new(Fixed(RawDetections::default())),
            ComputeDevice::Cpu,
            InferenceLimits::default(),
        );
        let err = service.predict(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)));
    }

    #[tokio::test]
    async fn slow_inference_times_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = InferenceService::new(
            Arc::new(Slow {
                delay: Duration::from_millis(300),
                calls: Arc::clone(&calls),
            }),
            ComputeDevice::Cpu,
            InferenceLimits {
                max_concurrent: 1,
                timeout: Duration::from_millis(50),
            },
        );

        let err = service.predict(png(2, 2)).await.unwrap_err();
        assert!(matches!(err, PredictError::Timeout(_)));

        // The abandoned task still finishes in the background.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped_to_one() {
        let service = InferenceService::new(
            Arc::new(Fixed(RawDetections::default())),
            ComputeDevice::Cpu,
            InferenceLimits {
                max_concurrent: 0,
                timeout: Duration::from_secs(5),
            },
        );
        assert!(service.predict(png(1, 1)).await.is_ok());
    }
}
