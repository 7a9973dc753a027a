//! Accelerator device accounting and container runtime integration
//!
//! Discovers accelerator devices, advertises their capacity as whole-device
//! and fractional-share slots, tracks per-workload allocations, and turns
//! allocations into container creation parameters for the detected runtime
//! integration.

pub mod collector;
pub mod config;
pub mod error;
pub mod inventory;
pub mod ledger;
pub mod logging;
pub mod platform;
pub mod plugin;
pub mod runtime;
pub mod share;

#[cfg(test)]
mod testing;

pub use error::AcceleratorError;
pub use plugin::AcceleratorPlugin;
pub use plugin::Drivers;
