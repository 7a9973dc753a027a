use core::error::Error;

use api_types::DeviceId;
use api_types::SlotName;
use rust_decimal::Decimal;

/// Errors raised by the accelerator subsystem.
#[derive(Debug, derive_more::Display)]
pub enum AcceleratorError {
    /// The native enumeration/statistics driver is not installed
    #[display("Device driver unavailable: {driver}")]
    DriverUnavailable { driver: String },
    #[display("Device query failed: {message}")]
    DeviceQuery { message: String },
    #[display("Runtime helper version detection failed: {message}")]
    VersionDetectionFailed { message: String },
    #[display("Allocation of {requested} on device {device} exceeds {slot} capacity {capacity}")]
    OutOfCapacity {
        slot: SlotName,
        device: DeviceId,
        requested: Decimal,
        capacity: Decimal,
    },
    #[display("Unknown resource slot: {slot}")]
    UnknownSlot { slot: SlotName },
    #[display("Device {device} is not available for slot {slot}")]
    UnknownDevice { slot: SlotName, device: DeviceId },
    #[display("Invalid amount {amount} for {slot} on device {device}")]
    InvalidAmount {
        slot: SlotName,
        device: DeviceId,
        amount: Decimal,
    },
    #[display("Runtime integration endpoint unavailable: {message}")]
    RuntimeIntegrationUnavailable { message: String },
    #[display("Unsupported runtime integration protocol version {version}")]
    UnsupportedProtocolVersion { version: String },
    #[display("Container client error: {message}")]
    ContainerClient { message: String },
    #[display("Invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[display("Accelerator subsystem is disabled: {reason}")]
    Disabled { reason: String },
    #[display("Allocation ledger task is not running")]
    LedgerClosed,
}

impl Error for AcceleratorError {}
