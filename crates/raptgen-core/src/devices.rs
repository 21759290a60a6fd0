//! Compute device discovery.
//!
//! Every device is also a concurrency resource class: training units name the
//! device they run on, and the runtime keeps one admission gate per device.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A device a unit of work can be scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComputeDevice {
    Cpu,
    /// NVIDIA device by ordinal.
    Cuda(u32),
}

impl ComputeDevice {
    /// Resource class name used by the concurrency gate.
    pub fn resource_class(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Cuda(n) => write!(f, "CUDA:{}", n),
        }
    }
}

impl std::str::FromStr for ComputeDevice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "CPU" {
            return Ok(Self::Cpu);
        }
        if let Some(ordinal) = upper.strip_prefix("CUDA:") {
            return ordinal
                .parse()
                .map(Self::Cuda)
                .map_err(|_| Error::InvalidInput(format!("invalid CUDA ordinal: {}", s)));
        }
        Err(Error::InvalidInput(format!("unknown device: {}", s)))
    }
}

impl TryFrom<String> for ComputeDevice {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ComputeDevice> for String {
    fn from(device: ComputeDevice) -> Self {
        device.to_string()
    }
}

/// Devices discovered on the current host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInventory {
    /// Number of CPU cores.
    pub cpu_cores: usize,
    /// Available devices, CPU first.
    pub devices: Vec<ComputeDevice>,
}

impl DeviceInventory {
    /// Discover compute devices of the current system.
    pub fn discover() -> Self {
        let mut devices = vec![ComputeDevice::Cpu];
        devices.extend(Self::detect_cuda().into_iter().map(ComputeDevice::Cuda));
        let inventory = Self {
            cpu_cores: num_cpus(),
            devices,
        };
        tracing::debug!(
            "Discovered compute devices: {:?} ({} CPU cores)",
            inventory.names(),
            inventory.cpu_cores
        );
        inventory
    }

    /// Device names as exposed to clients (`CPU`, `CUDA:0`, ...).
    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.to_string()).collect()
    }

    pub fn contains(&self, device: ComputeDevice) -> bool {
        self.devices.contains(&device)
    }

    fn detect_cuda() -> Vec<u32> {
        #[cfg(target_os = "linux")]
        {
            // NVIDIA exposes one /dev/nvidiaN node per device
            let mut ordinals: Vec<u32> = std::fs::read_dir("/dev")
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .filter_map(|e| {
                            e.file_name()
                                .to_str()
                                .and_then(|name| name.strip_prefix("nvidia"))
                                .and_then(|n| n.parse::<u32>().ok())
                        })
                        .collect()
                })
                .unwrap_or_default();
            ordinals.sort_unstable();
            ordinals
        }
        #[cfg(not(target_os = "linux"))]
        {
            Vec::new()
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names_round_trip() {
        assert_eq!("cpu".parse::<ComputeDevice>().unwrap(), ComputeDevice::Cpu);
        assert_eq!(
            "CUDA:1".parse::<ComputeDevice>().unwrap(),
            ComputeDevice::Cuda(1)
        );
        assert_eq!(ComputeDevice::Cuda(0).to_string(), "CUDA:0");
        assert!("tpu".parse::<ComputeDevice>().is_err());
        assert!("CUDA:x".parse::<ComputeDevice>().is_err());
    }

    #[test]
    fn test_discover_always_has_cpu() {
        let inv = DeviceInventory::discover();
        assert_eq!(inv.devices[0], ComputeDevice::Cpu);
        assert!(inv.cpu_cores >= 1);
        assert_eq!(inv.names()[0], "CPU");
    }

    #[test]
    fn test_device_serde_as_string() {
        let json = serde_json::to_string(&ComputeDevice::Cuda(2)).unwrap();
        assert_eq!(json, "\"CUDA:2\"");
        let back: ComputeDevice = serde_json::from_str("\"CPU\"").unwrap();
        assert_eq!(back, ComputeDevice::Cpu);
    }
}
