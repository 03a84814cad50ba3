//! Compute device selection for the ONNX Runtime session.

use std::fmt;

use clap::ValueEnum;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
};
use tracing::{info, warn};

use crate::error::ModelLoadError;

/// Device requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DevicePreference {
    /// CUDA when the runtime offers it, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

/// Device the model actually runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Cuda,
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => f.write_str("cpu"),
            ComputeDevice::Cuda => f.write_str("cuda"),
        }
    }
}

impl ComputeDevice {
    /// Execution providers to register on the session, in priority order.
    pub fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            ComputeDevice::Cpu => vec![CPUExecutionProvider::default().build()],
            ComputeDevice::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
        }
    }
}

/// Returns true if the loaded ONNX Runtime exposes a usable CUDA provider.
pub fn cuda_available() -> bool {
    match CUDAExecutionProvider::default().is_available() {
        Ok(available) => available,
        Err(e) => {
            warn!("Could not query CUDA execution provider: {e}");
            false
        }
    }
}

/// Picks the device to load the model on.
///
/// # Errors
///
/// Returns [`ModelLoadError::DeviceUnavailable`] when CUDA is explicitly
/// requested but the runtime does not provide it.
pub fn select_device(preference: DevicePreference) -> Result<ComputeDevice, ModelLoadError> {
    let device = resolve(preference, cuda_available())?;
    info!("Using {device} for inference");
    Ok(device)
}

fn resolve(preference: DevicePreference, cuda: bool) -> Result<ComputeDevice, ModelLoadError> {
    match (preference, cuda) {
        (DevicePreference::Cpu, _) => Ok(ComputeDevice::Cpu),
        (DevicePreference::Auto, true) | (DevicePreference::Cuda, true) => Ok(ComputeDevice::Cuda),
        (DevicePreference::Auto, false) => Ok(ComputeDevice::Cpu),
        (DevicePreference::Cuda, false) => Err(ModelLoadError::DeviceUnavailable(ComputeDevice::Cuda)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_prefers_accelerator() {
        assert_eq!(resolve(DevicePreference::Auto, true).unwrap(), ComputeDevice::Cuda);
        assert_eq!(resolve(DevicePreference::Auto, false).unwrap(), ComputeDevice::Cpu);
    }

    #[test]
    fn cpu_is_always_honoured() {
        assert_eq!(resolve(DevicePreference::Cpu, true).unwrap(), ComputeDevice::Cpu);
    }

    #[test]
    fn explicit_cuda_without_runtime_support_fails() {
        let err = resolve(DevicePreference::Cuda, false).unwrap_err();
        assert!(matches!(err, ModelLoadError::DeviceUnavailable(ComputeDevice::Cuda)));
    }

    #[test]
    fn device_strings() {
        assert_eq!(ComputeDevice::Cpu.to_string(), "cpu");
        assert_eq!(ComputeDevice::Cuda.to_string(), "cuda");
    }
}
