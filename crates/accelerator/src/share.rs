//! Conversion between raw device units and quantized shares.
//!
//! Capacity is always rounded toward zero and demand away from zero, so a
//! device never advertises more than it has and a request is never admitted
//! for less than it needs.

use std::num::NonZeroU32;
use std::num::NonZeroU64;

use api_types::DeviceDescriptor;
use error_stack::Report;
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

use crate::config::ShareUnits;
use crate::error::AcceleratorError;

/// Largest scale a `Decimal` can carry.
const MAX_QUANTUM_DIGITS: u32 = 28;

/// Concrete resource amounts corresponding to a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareSpec {
    pub memory: Decimal,
    pub processing: Decimal,
}

/// Conversion parameters for one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareInfo {
    unit_memory: NonZeroU64,
    unit_processing: NonZeroU32,
    quantum_digits: u32,
}

impl ShareInfo {
    pub fn new(units: ShareUnits) -> Result<Self, Report<AcceleratorError>> {
        let unit_memory = NonZeroU64::new(units.unit_memory).ok_or_else(|| {
            Report::new(AcceleratorError::InvalidConfig {
                message: "unit_memory must be greater than zero".to_string(),
            })
        })?;
        let unit_processing = NonZeroU32::new(units.unit_processing).ok_or_else(|| {
            Report::new(AcceleratorError::InvalidConfig {
                message: "unit_processing must be greater than zero".to_string(),
            })
        })?;
        if units.quantum_digits > MAX_QUANTUM_DIGITS {
            return Err(Report::new(AcceleratorError::InvalidConfig {
                message: format!(
                    "share quantum of {} digits exceeds {MAX_QUANTUM_DIGITS}",
                    units.quantum_digits
                ),
            }));
        }

        Ok(Self {
            unit_memory,
            unit_processing,
            quantum_digits: units.quantum_digits,
        })
    }

    pub fn unit_memory(&self) -> u64 {
        self.unit_memory.get()
    }

    pub fn unit_processing(&self) -> u32 {
        self.unit_processing.get()
    }

    pub fn quantum_digits(&self) -> u32 {
        self.quantum_digits
    }

    /// Shares one device can provide, rounded toward zero.
    pub fn max_share(&self, device: &DeviceDescriptor) -> Decimal {
        self.max_share_for(
            Decimal::from(device.memory_size),
            Decimal::from(device.processing_units),
        )
    }

    /// Shares provided by raw memory and processing amounts, rounded toward zero.
    pub fn max_share_for(&self, memory: Decimal, processing: Decimal) -> Decimal {
        let (mem_shares, proc_shares) = self.raw_shares(memory, processing);
        mem_shares
            .min(proc_shares)
            .round_dp_with_strategy(self.quantum_digits, RoundingStrategy::ToZero)
    }

    /// Raw amounts backing `share`; no rounding beyond the share's own precision.
    pub fn share_to_spec(&self, share: Decimal) -> ShareSpec {
        ShareSpec {
            memory: Decimal::from(self.unit_memory.get()) * share,
            processing: Decimal::from(self.unit_processing.get()) * share,
        }
    }

    /// Shares required by a request, rounded away from zero.
    pub fn spec_to_share(&self, requested_memory: Decimal, requested_processing: Decimal) -> Decimal {
        let (mem_shares, proc_shares) = self.raw_shares(requested_memory, requested_processing);
        mem_shares
            .max(proc_shares)
            .round_dp_with_strategy(self.quantum_digits, RoundingStrategy::AwayFromZero)
    }

    fn raw_shares(&self, memory: Decimal, processing: Decimal) -> (Decimal, Decimal) {
        (
            memory / Decimal::from(self.unit_memory.get()),
            processing / Decimal::from(self.unit_processing.get()),
        )
    }
}
