//! Compute device detection.
//!
//! The gateway never loads models itself, so the detected device is a routing
//! hint: it reflects what the co-located recognition backends can use.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Mps,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        }
    }
}

/// Detect the best available compute device.
///
/// `OCR_DEVICE` wins when set to a known value; otherwise look for an NVIDIA
/// driver, then Apple silicon.
pub fn detect_device() -> Device {
    if let Ok(forced) = std::env::var("OCR_DEVICE") {
        match forced.as_str() {
            "cuda" => return Device::Cuda,
            "mps" => return Device::Mps,
            "cpu" => return Device::Cpu,
            _ => {}
        }
    }

    if cuda_present() {
        return Device::Cuda;
    }
    if cfg!(target_os = "macos") {
        return Device::Mps;
    }
    Device::Cpu
}

fn cuda_present() -> bool {
    if std::path::Path::new("/proc/driver/nvidia").exists() {
        return true;
    }
    matches!(std::env::var("CUDA_VISIBLE_DEVICES"), Ok(v) if !v.is_empty() && v != "-1")
}

pub fn has_gpu() -> bool {
    detect_device() == Device::Cuda
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub detected_device: Device,
    pub cpu_count: usize,
    pub cuda_available: bool,
    pub mps_available: bool,
}

pub fn device_info() -> DeviceInfo {
    let detected = detect_device();
    DeviceInfo {
        detected_device: detected,
        cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        cuda_available: detected == Device::Cuda,
        mps_available: detected == Device::Mps,
    }
}
