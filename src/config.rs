//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::device::DevicePreference;
use crate::service::InferenceLimits;

pub const DEFAULT_PORT: u16 = 7001;

/// Largest accepted request body.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "helmet-api", version, about = "Helmet / bare-head detection over HTTP")]
pub struct Config {
    /// ONNX export of the 3-class Faster R-CNN
    #[arg(long, env = "HELMET_MODEL", default_value = "helmet_model.onnx")]
    pub model: PathBuf,

    #[arg(long, env = "HELMET_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    #[arg(long, env = "HELMET_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Compute device for inference
    #[arg(long, env = "HELMET_DEVICE", value_enum, default_value_t = DevicePreference::Auto)]
    pub device: DevicePreference,

    /// ONNX Runtime intra-op threads (runtime default when unset)
    #[arg(long, env = "HELMET_INTRA_THREADS")]
    pub intra_threads: Option<usize>,

    /// Inferences allowed to run at the same time
    #[arg(long, env = "HELMET_MAX_CONCURRENT", default_value = "2")]
    pub max_concurrent_inferences: NonZeroUsize,

    /// Per-request budget for waiting on and running inference
    #[arg(long, env = "HELMET_INFERENCE_TIMEOUT", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub inference_timeout_secs: u64,

    #[arg(long, env = "HELMET_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn inference_limits(&self) -> InferenceLimits {
        InferenceLimits {
            max_concurrent: self.max_concurrent_inferences.get(),
            timeout: Duration::from_secs(self.inference_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_all_interfaces() {
        let config = Config::try_parse_from(["helmet-api"]).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:7001".parse().unwrap());
        assert_eq!(config.model, PathBuf::from("helmet_model.onnx"));
        assert_eq!(config.device, DevicePreference::Auto);
        assert_eq!(config.inference_limits().max_concurrent, 2);
        assert_eq!(config.inference_limits().timeout, Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "helmet-api",
            "--model",
            "/models/helmet.onnx",
            "--port",
            "8080",
            "--device",
            "cpu",
            "--max-concurrent-inferences",
            "4",
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.device, DevicePreference::Cpu);
        assert_eq!(config.inference_limits().max_concurrent, 4);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(Config::try_parse_from(["helmet-api", "--max-concurrent-inferences", "0"]).is_err());
        assert!(Config::try_parse_from(["helmet-api", "--inference-timeout-secs", "0"]).is_err());
    }
}
