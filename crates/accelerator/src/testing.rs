//! In-memory drivers and container client for unit tests.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use error_stack::Report;

use crate::collector::DeviceStats;
use crate::collector::StatsDriver;
use crate::error::AcceleratorError;
use crate::inventory::DeviceDriver;
use crate::inventory::DeviceProperties;
use crate::runtime::ContainerClient;

fn unavailable(driver: &str) -> Report<AcceleratorError> {
    Report::new(AcceleratorError::DriverUnavailable {
        driver: driver.to_string(),
    })
}

/// Device driver returning a replaceable device list; `None` means not installed.
pub(crate) struct MockDeviceDriver {
    devices: Mutex<Option<Vec<DeviceProperties>>>,
}

impl MockDeviceDriver {
    pub(crate) fn with_devices(devices: Vec<DeviceProperties>) -> Self {
        Self {
            devices: Mutex::new(Some(devices)),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            devices: Mutex::new(None),
        }
    }

    pub(crate) fn set_devices(&self, devices: Vec<DeviceProperties>) {
        *self.devices.lock().unwrap() = Some(devices);
    }
}

impl DeviceDriver for MockDeviceDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceProperties>, Report<AcceleratorError>> {
        self.devices
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("mock"))
    }
}

pub(crate) struct MockStatsDriver {
    stats: Option<Vec<DeviceStats>>,
}

impl MockStatsDriver {
    pub(crate) fn with_stats(stats: Vec<DeviceStats>) -> Self {
        Self { stats: Some(stats) }
    }

    pub(crate) fn unavailable() -> Self {
        Self { stats: None }
    }
}

impl StatsDriver for MockStatsDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn device_stats(&self) -> Result<Vec<DeviceStats>, Report<AcceleratorError>> {
        self.stats.clone().ok_or_else(|| unavailable("mock"))
    }
}

/// Records volume creations.
#[derive(Default)]
pub(crate) struct MockContainerClient {
    volumes: Mutex<BTreeSet<String>>,
    created: Mutex<Vec<(String, String)>>,
}

impl MockContainerClient {
    pub(crate) fn with_volumes<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            volumes: Mutex::new(names.into_iter().map(str::to_string).collect()),
            created: Mutex::default(),
        }
    }

    /// `(name, driver)` of every volume created so far.
    pub(crate) fn created(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerClient for MockContainerClient {
    async fn list_volumes(&self) -> Result<Vec<String>, Report<AcceleratorError>> {
        Ok(self.volumes.lock().unwrap().iter().cloned().collect())
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), Report<AcceleratorError>> {
        self.volumes.lock().unwrap().insert(name.to_string());
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), driver.to_string()));
        Ok(())
    }
}
