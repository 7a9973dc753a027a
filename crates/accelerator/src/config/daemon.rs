use std::path::PathBuf;

use clap::Parser;

use super::DeviceFamily;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "ACCEL_DEVICE_FAMILY",
        value_enum,
        default_value = "cuda",
        help = "Accelerator family managed by this agent"
    )]
    pub device_family: DeviceFamily,

    #[arg(
        long,
        env = "ACCEL_DEVICE_MASK",
        help = "Comma-separated device ids excluded from discovery and accounting, e.g. 0,3"
    )]
    pub device_mask: Option<String>,

    #[arg(
        long,
        env = "ACCEL_HELPER_BINARY",
        value_hint = clap::ValueHint::CommandName,
        help = "Runtime-integration helper probed with `version`, defaults to the family helper (nvidia-docker for cuda)"
    )]
    pub helper_binary: Option<PathBuf>,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for the helper version probe"
    )]
    pub probe_timeout_secs: u64,

    #[arg(
        long,
        env = "ACCEL_VOLUME_PLUGIN_URL",
        default_value = "http://localhost:3476",
        help = "Base URL of the V1 volume plugin control endpoint"
    )]
    pub volume_plugin_url: String,

    #[arg(
        long,
        default_value = "3",
        help = "Seconds to wait for the V1 volume plugin endpoint"
    )]
    pub volume_plugin_timeout_secs: u64,

    #[arg(
        long,
        env = "ACCEL_DOCKER_BINARY",
        value_hint = clap::ValueHint::CommandName,
        default_value = "docker",
        help = "Container engine CLI used to list and create driver volumes"
    )]
    pub docker_binary: PathBuf,

    #[arg(
        long,
        default_value = "2",
        help = "Decimal digits kept when quantizing shares"
    )]
    pub share_quantum_digits: u32,

    #[arg(long, help = "Bytes of device memory per share, defaults per device family")]
    pub unit_memory: Option<u64>,

    #[arg(long, help = "Processing units per share, defaults per device family")]
    pub unit_processing: Option<u32>,

    #[arg(
        long,
        env = "ACCEL_SYSFS_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys",
        help = "sysfs mount used for NUMA topology lookups"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between measurement collection cycles"
    )]
    pub collect_interval_secs: u64,

    #[arg(
        long,
        env = "ACCEL_MEASUREMENTS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "logs/measurements.log",
        help = "Path for the InfluxDB line-protocol measurement log"
    )]
    pub measurements_file: PathBuf,
}
