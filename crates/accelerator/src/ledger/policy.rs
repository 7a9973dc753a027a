//! Slot capacity strategies.

use std::fmt::Debug;

use api_types::DeviceDescriptor;
use api_types::SlotKind;
use api_types::SlotName;
use rust_decimal::Decimal;

use crate::share::ShareInfo;

/// Capacity strategy for one resource slot.
pub trait SlotPolicy: Debug + Send + Sync {
    fn slot(&self) -> &SlotName;

    fn kind(&self) -> SlotKind;

    /// Capacity one device contributes to this slot.
    fn capacity(&self, device: &DeviceDescriptor) -> Decimal;
}

/// One unit per device, for whole-device allocation.
#[derive(Debug, Clone)]
pub struct DeviceCountSlot {
    slot: SlotName,
}

impl DeviceCountSlot {
    pub fn new(slot: SlotName) -> Self {
        Self { slot }
    }
}

impl SlotPolicy for DeviceCountSlot {
    fn slot(&self) -> &SlotName {
        &self.slot
    }

    fn kind(&self) -> SlotKind {
        SlotKind::Count
    }

    fn capacity(&self, _device: &DeviceDescriptor) -> Decimal {
        Decimal::ONE
    }
}

/// Quantized share capacity derived from memory and processing units.
#[derive(Debug, Clone)]
pub struct FractionalShareSlot {
    slot: SlotName,
    share: ShareInfo,
}

impl FractionalShareSlot {
    pub fn new(slot: SlotName, share: ShareInfo) -> Self {
        Self { slot, share }
    }
}

impl SlotPolicy for FractionalShareSlot {
    fn slot(&self) -> &SlotName {
        &self.slot
    }

    fn kind(&self) -> SlotKind {
        SlotKind::Share
    }

    fn capacity(&self, device: &DeviceDescriptor) -> Decimal {
        self.share.max_share(device)
    }
}
