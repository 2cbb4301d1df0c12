//! # Compute Device Selection
//!
//! Picks the Candle device the Whisper model runs on. GPU requests fall back
//! to CPU when the backend is missing, so a misconfigured host still serves.

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    /// Falls back to CPU if CUDA is not available
    Cuda,
    /// Falls back to CPU if Metal is not available
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a preference to a concrete device.
pub fn select_device(preference: DevicePreference) -> Device {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda().unwrap_or(Device::Cpu),
        DevicePreference::Metal => metal().unwrap_or(Device::Cpu),
        DevicePreference::Auto => cuda().or_else(metal).unwrap_or(Device::Cpu),
    };

    info!("Selected {} for inference (requested {:?})", device_label(&device), preference);
    device
}

/// Parse a configured device string; unknown values select automatically.
pub fn select_device_from_str(device_str: &str) -> Device {
    let preference = device_str.parse::<DevicePreference>().unwrap_or_else(|e| {
        warn!("{}, using auto", e);
        DevicePreference::Auto
    });
    select_device(preference)
}

fn cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| debug!("CUDA not available: {}", e))
        .ok()
}

fn metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| debug!("Metal not available: {}", e))
        .ok()
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}

/// What the health endpoint reports about the inference device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: &'static str,
    pub threads: usize,
}
