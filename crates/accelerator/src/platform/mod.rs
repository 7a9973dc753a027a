//! Native driver integrations
//!
//! - NVML for CUDA device enumeration and statistics
//! - the `ctpu` CLI for Cloud TPU enumeration
//! - sysfs for PCI topology

pub mod ctpu;
pub mod nvml;
pub mod sysfs;

pub use ctpu::CtpuDriver;
pub use nvml::NvmlDriver;
