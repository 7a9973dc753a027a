pub mod cli;
pub mod daemon;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use api_types::DeviceId;
use api_types::SlotKind;
use api_types::SlotName;

pub use cli::*;
pub use daemon::*;

const GIB: u64 = 1 << 30;

/// Accelerator family managed by one plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, derive_more::Display)]
pub enum DeviceFamily {
    #[display("cuda")]
    Cuda,
    #[display("tpu")]
    Tpu,
}

impl DeviceFamily {
    /// Key of this family in a container's resource spec.
    pub fn key(self) -> &'static str {
        match self {
            DeviceFamily::Cuda => "cuda",
            DeviceFamily::Tpu => "tpu",
        }
    }

    /// Slots accounted for this family, in reporting order.
    pub fn slots(self) -> [(SlotName, SlotKind); 2] {
        let key = self.key();
        [
            (SlotName::new(format!("{key}.device")), SlotKind::Count),
            (SlotName::new(format!("{key}.shares")), SlotKind::Share),
        ]
    }

    pub fn default_share_units(self) -> ShareUnits {
        match self {
            DeviceFamily::Cuda => ShareUnits {
                unit_memory: 2 * GIB,
                unit_processing: 256,
                quantum_digits: 2,
            },
            DeviceFamily::Tpu => ShareUnits {
                unit_memory: 2 * GIB,
                unit_processing: 1,
                quantum_digits: 2,
            },
        }
    }

    pub fn default_helper_binary(self) -> PathBuf {
        match self {
            DeviceFamily::Cuda => PathBuf::from("nvidia-docker"),
            DeviceFamily::Tpu => PathBuf::from("ctpu"),
        }
    }
}

/// Device ids excluded from discovery, accounting and exposure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMask(BTreeSet<DeviceId>);

impl DeviceMask {
    /// Parse a comma-separated id list; blank entries are ignored.
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(DeviceId::from)
                .collect(),
        )
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.0.contains(device)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<I: Into<DeviceId>> FromIterator<I> for DeviceMask {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Raw units making up one full share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareUnits {
    /// Bytes of device memory per share
    pub unit_memory: u64,
    /// Processing units per share
    pub unit_processing: u32,
    /// Decimal digits kept when quantizing a share
    pub quantum_digits: u32,
}

/// Runtime configuration of the accelerator plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub family: DeviceFamily,
    pub device_mask: DeviceMask,
    pub helper_binary: PathBuf,
    pub probe_timeout: Duration,
    pub volume_plugin_url: String,
    pub volume_plugin_timeout: Duration,
    pub share_units: ShareUnits,
    pub sysfs_root: PathBuf,
    pub collect_interval: Duration,
}

impl PluginConfig {
    /// Defaults for a family, without any mask.
    pub fn for_family(family: DeviceFamily) -> Self {
        Self {
            family,
            device_mask: DeviceMask::default(),
            helper_binary: family.default_helper_binary(),
            probe_timeout: Duration::from_secs(5),
            volume_plugin_url: "http://localhost:3476".to_string(),
            volume_plugin_timeout: Duration::from_secs(3),
            share_units: family.default_share_units(),
            sysfs_root: PathBuf::from("/sys"),
            collect_interval: Duration::from_secs(5),
        }
    }
}

impl From<&DaemonArgs> for PluginConfig {
    fn from(args: &DaemonArgs) -> Self {
        let defaults = args.device_family.default_share_units();
        Self {
            family: args.device_family,
            device_mask: args
                .device_mask
                .as_deref()
                .map(DeviceMask::parse)
                .unwrap_or_default(),
            helper_binary: args
                .helper_binary
                .clone()
                .unwrap_or_else(|| args.device_family.default_helper_binary()),
            probe_timeout: Duration::from_secs(args.probe_timeout_secs),
            volume_plugin_url: args.volume_plugin_url.clone(),
            volume_plugin_timeout: Duration::from_secs(args.volume_plugin_timeout_secs),
            share_units: ShareUnits {
                unit_memory: args.unit_memory.unwrap_or(defaults.unit_memory),
                unit_processing: args.unit_processing.unwrap_or(defaults.unit_processing),
                quantum_digits: args.share_quantum_digits,
            },
            sysfs_root: args.sysfs_root.clone(),
            collect_interval: Duration::from_secs(args.collect_interval_secs.max(1)),
        }
    }
}
