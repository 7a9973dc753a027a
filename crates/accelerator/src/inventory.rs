//! Device inventory
//!
//! Turns the structured property records returned by a device driver into
//! [`DeviceDescriptor`]s, applying the administrator's device mask and
//! filling in topology details. Every listing re-queries the driver.

use std::path::PathBuf;
use std::sync::Arc;

use api_types::DeviceDescriptor;
use api_types::DeviceId;
use api_types::NIL_UUID;
use error_stack::Report;

use crate::config::DeviceMask;
use crate::error::AcceleratorError;
use crate::platform::sysfs;

/// Properties of one device as reported by a native driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub index: u32,
    /// PCI bus id used for NUMA lookups, absent for non-PCI devices
    pub pci_bus_id: Option<String>,
    pub hw_location: String,
    pub memory_size: u64,
    pub processing_units: u32,
    pub model_name: String,
    pub uuid: Option<String>,
}

/// Opaque device enumeration driver.
///
/// Implementations block; callers run them off the async runtime threads.
pub trait DeviceDriver: Send + Sync {
    /// Driver name used in logs and errors.
    fn name(&self) -> &str;

    /// Enumerate all devices.
    ///
    /// Returns [`AcceleratorError::DriverUnavailable`] when the native
    /// library or tool is not installed, as opposed to an empty list.
    fn enumerate(&self) -> Result<Vec<DeviceProperties>, Report<AcceleratorError>>;
}

pub struct Inventory {
    driver: Arc<dyn DeviceDriver>,
    mask: DeviceMask,
    sysfs_root: PathBuf,
}

impl Inventory {
    pub fn new(driver: Arc<dyn DeviceDriver>, mask: DeviceMask, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            mask,
            sysfs_root: sysfs_root.into(),
        }
    }

    pub fn mask(&self) -> &DeviceMask {
        &self.mask
    }

    /// List unmasked devices.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Report<AcceleratorError>> {
        let properties = self.driver.enumerate()?;

        let devices: Vec<DeviceDescriptor> = properties
            .into_iter()
            .filter_map(|props| {
                let device_id = DeviceId::from(props.index);
                if self.mask.contains(&device_id) {
                    tracing::debug!(device_id = %device_id, "device excluded by mask");
                    return None;
                }
                Some(self.describe(device_id, props))
            })
            .collect();

        tracing::debug!(count = devices.len(), "listed devices");
        Ok(devices)
    }

    fn describe(&self, device_id: DeviceId, props: DeviceProperties) -> DeviceDescriptor {
        let numa_node = props
            .pci_bus_id
            .as_deref()
            .and_then(|bus_id| sysfs::numa_node(&self.sysfs_root, bus_id));

        let unique_id = props.uuid.unwrap_or_else(|| {
            tracing::debug!(device_id = %device_id, "device UUID unavailable, using nil UUID");
            NIL_UUID.to_string()
        });

        DeviceDescriptor {
            device_id,
            hw_location: props.hw_location,
            numa_node,
            memory_size: props.memory_size,
            processing_units: props.processing_units,
            model_name: props.model_name,
            unique_id,
        }
    }
}
