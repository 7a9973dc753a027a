//! NVIDIA Management Library (NVML) driver
//!
//! Provides both device enumeration and live statistics for CUDA devices.

use std::ffi::OsStr;

use api_types::DeviceId;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::Nvml;

use crate::collector::DeviceStats;
use crate::collector::StatsDriver;
use crate::error::AcceleratorError;
use crate::inventory::DeviceDriver;
use crate::inventory::DeviceProperties;

const DRIVER_NAME: &str = "nvml";

pub struct NvmlDriver {
    nvml: Nvml,
}

impl NvmlDriver {
    /// Load NVML, falling back to the versioned soname.
    pub fn init() -> Result<Self, Report<AcceleratorError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(e) => {
                tracing::warn!(error = %e, "Standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(AcceleratorError::DriverUnavailable {
                        driver: DRIVER_NAME.to_string(),
                    })?
            }
        };
        tracing::info!("NVML initialized successfully");
        Ok(Self { nvml })
    }

    fn device_count(&self) -> Result<u32, Report<AcceleratorError>> {
        self.nvml
            .device_count()
            .change_context(AcceleratorError::DeviceQuery {
                message: "failed to read NVML device count".to_string(),
            })
    }

    fn query_error(index: u32, what: &str) -> AcceleratorError {
        AcceleratorError::DeviceQuery {
            message: format!("failed to read {what} of device {index}"),
        }
    }
}

impl DeviceDriver for NvmlDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn enumerate(&self) -> Result<Vec<DeviceProperties>, Report<AcceleratorError>> {
        let count = self.device_count()?;
        let mut devices = Vec::with_capacity(count as usize);

        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .change_context_lazy(|| Self::query_error(index, "handle"))?;
            let memory = device
                .memory_info()
                .change_context_lazy(|| Self::query_error(index, "memory info"))?;

            let pci_bus_id = match device.pci_info() {
                Ok(pci) => Some(pci.bus_id),
                Err(e) => {
                    tracing::debug!(index, error = %e, "PCI info unavailable");
                    None
                }
            };
            let processing_units = device.num_cores().unwrap_or_else(|e| {
                tracing::warn!(index, error = %e, "core count unavailable, reporting 0");
                0
            });

            devices.push(DeviceProperties {
                index,
                hw_location: pci_bus_id.clone().unwrap_or_else(|| "unknown".to_string()),
                pci_bus_id,
                memory_size: memory.total,
                processing_units,
                model_name: device.name().unwrap_or_else(|_| "unknown".to_string()),
                uuid: device.uuid().ok(),
            });
        }

        Ok(devices)
    }
}

impl StatsDriver for NvmlDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn device_stats(&self) -> Result<Vec<DeviceStats>, Report<AcceleratorError>> {
        let count = self.device_count()?;
        let mut stats = Vec::with_capacity(count as usize);

        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .change_context_lazy(|| Self::query_error(index, "handle"))?;
            let memory = device
                .memory_info()
                .change_context_lazy(|| Self::query_error(index, "memory info"))?;
            let utilization = device
                .utilization_rates()
                .change_context_lazy(|| Self::query_error(index, "utilization"))?;

            stats.push(DeviceStats {
                device_id: DeviceId::from(index),
                memory_used: memory.used,
                memory_total: memory.total,
                utilization_percent: utilization.gpu,
            });
        }

        Ok(stats)
    }
}
