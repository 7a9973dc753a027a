//! Allocation ledger
//!
//! Tracks, per workload, how much of each slot on each device is allocated,
//! and validates every change against the capacity derived from the latest
//! inventory listing. `apply` and restoration go through one merge primitive
//! that builds the candidate state aside and only commits it when valid.

pub mod handle;
pub mod policy;

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::AllocationMap;
use api_types::DeviceDescriptor;
use api_types::DeviceId;
use api_types::ResourceSpec;
use api_types::SlotKind;
use api_types::SlotName;
use api_types::WorkloadId;
use error_stack::Report;
use rust_decimal::Decimal;

pub use handle::LedgerHandle;
pub use policy::DeviceCountSlot;
pub use policy::FractionalShareSlot;
pub use policy::SlotPolicy;

use crate::error::AcceleratorError;

/// Per-slot, per-device capacity.
pub type SlotCapacity = BTreeMap<SlotName, BTreeMap<DeviceId, Decimal>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    /// Add to the owner's amounts; any violation rejects the whole request.
    Apply,
    /// Replace the owner's amounts; violations are logged and tolerated.
    Restore,
}

/// Allocations of every workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    workloads: BTreeMap<WorkloadId, AllocationMap>,
}

impl LedgerState {
    pub fn allocation_of(&self, owner: &WorkloadId) -> Option<&AllocationMap> {
        self.workloads.get(owner)
    }

    pub fn workloads(&self) -> impl Iterator<Item = (&WorkloadId, &AllocationMap)> {
        self.workloads.iter()
    }

    /// Node-wide sum over all workloads.
    ///
    /// Committed states always have representable totals; merges reject
    /// candidates whose sums overflow.
    pub fn totals(&self) -> AllocationMap {
        let mut totals = AllocationMap::new();
        for allocation in self.workloads.values() {
            if let Err((slot, device)) = totals.checked_merge_from(allocation) {
                tracing::error!(%slot, %device, "allocation total overflows");
            }
        }
        totals
    }

    /// Sum of one slot on one device, `None` on overflow.
    fn checked_total(&self, slot: &SlotName, device: &DeviceId) -> Option<Decimal> {
        self.workloads
            .values()
            .try_fold(Decimal::ZERO, |total, allocation| {
                total.checked_add(allocation.get(slot, device))
            })
    }
}

/// Outcome of restoring one workload's allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Amounts recorded for the workload
    pub restored: AllocationMap,
    /// Entries dropped because the slot or device is not in the inventory
    pub skipped: Vec<(SlotName, DeviceId)>,
    /// Entries whose node-wide total now exceeds capacity
    pub overcommitted: Vec<(SlotName, DeviceId)>,
}

pub struct AllocationLedger {
    policies: Vec<Arc<dyn SlotPolicy>>,
    capacity: SlotCapacity,
    state: LedgerState,
}

impl AllocationLedger {
    pub fn new(policies: Vec<Arc<dyn SlotPolicy>>, devices: &[DeviceDescriptor]) -> Self {
        let mut ledger = Self {
            policies,
            capacity: SlotCapacity::new(),
            state: LedgerState::default(),
        };
        ledger.sync_devices(devices);
        ledger
    }

    /// Recompute capacity from a fresh inventory listing.
    ///
    /// Allocations on devices that disappeared are kept; they no longer
    /// count towards capacity and cannot be extended.
    pub fn sync_devices(&mut self, devices: &[DeviceDescriptor]) {
        self.capacity = self
            .policies
            .iter()
            .map(|policy| {
                let per_device = devices
                    .iter()
                    .map(|device| (device.device_id.clone(), policy.capacity(device)))
                    .collect();
                (policy.slot().clone(), per_device)
            })
            .collect();
    }

    pub fn slot_types(&self) -> BTreeMap<SlotName, SlotKind> {
        self.policies
            .iter()
            .map(|policy| (policy.slot().clone(), policy.kind()))
            .collect()
    }

    /// Total capacity per slot.
    pub fn available_slots(&self) -> BTreeMap<SlotName, Decimal> {
        self.capacity
            .iter()
            .map(|(slot, devices)| (slot.clone(), devices.values().copied().sum()))
            .collect()
    }

    pub fn capacity_of(&self, slot: &SlotName, device: &DeviceId) -> Option<Decimal> {
        self.capacity.get(slot)?.get(device).copied()
    }

    /// Add `allocation` to the owner's allocation.
    ///
    /// Fails without touching the ledger when a slot or device is unknown,
    /// an amount is negative, or a device would exceed its capacity.
    #[tracing::instrument(skip(self, allocation), fields(owner = %owner))]
    pub fn apply(
        &mut self,
        owner: &WorkloadId,
        allocation: &AllocationMap,
    ) -> Result<(), Report<AcceleratorError>> {
        self.merge(owner, allocation, MergeMode::Apply)?;
        tracing::info!(devices = ?allocation.devices(), "allocation applied");
        Ok(())
    }

    /// Record the allocation a running workload was started with.
    ///
    /// Restoring the same spec again yields the same state. Entries for
    /// slots or devices missing from the inventory are skipped.
    #[tracing::instrument(skip(self, spec), fields(owner = %owner))]
    pub fn restore_from_external_spec(
        &mut self,
        owner: &WorkloadId,
        family: &str,
        spec: &ResourceSpec,
    ) -> RestoreReport {
        let Some(allocation) = spec.family_allocation(family) else {
            tracing::debug!("resource spec has no {family} allocation");
            return RestoreReport::default();
        };

        match self.merge(owner, &allocation, MergeMode::Restore) {
            Ok(report) => {
                tracing::info!(
                    skipped = report.skipped.len(),
                    overcommitted = report.overcommitted.len(),
                    "allocation restored"
                );
                report
            }
            Err(e) => {
                // tolerant merges do not fail
                tracing::error!(error = ?e, "allocation restore failed");
                RestoreReport::default()
            }
        }
    }

    /// Drop the owner's allocation, returning what it held.
    pub fn release(&mut self, owner: &WorkloadId) -> Option<AllocationMap> {
        let released = self.state.workloads.remove(owner);
        if released.is_some() {
            tracing::info!(owner = %owner, "allocation released");
        }
        released
    }

    pub fn allocations(&self) -> AllocationMap {
        self.state.totals()
    }

    pub fn allocation_of(&self, owner: &WorkloadId) -> AllocationMap {
        self.state.allocation_of(owner).cloned().unwrap_or_default()
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    fn merge(
        &mut self,
        owner: &WorkloadId,
        allocation: &AllocationMap,
        mode: MergeMode,
    ) -> Result<RestoreReport, Report<AcceleratorError>> {
        let mut report = RestoreReport::default();
        let mut candidate = self.state.clone();
        let mut entry = candidate.workloads.remove(owner).unwrap_or_default();
        let mut touched = Vec::new();

        for (slot, device, amount) in allocation.iter() {
            let rejection = if !self.capacity.contains_key(slot) {
                Some(AcceleratorError::UnknownSlot { slot: slot.clone() })
            } else if self.capacity_of(slot, device).is_none() {
                Some(AcceleratorError::UnknownDevice {
                    slot: slot.clone(),
                    device: device.clone(),
                })
            } else if amount < Decimal::ZERO {
                Some(invalid_amount(slot, device, amount))
            } else {
                match mode {
                    MergeMode::Apply => entry
                        .checked_add(slot.clone(), device.clone(), amount)
                        .is_none()
                        .then(|| invalid_amount(slot, device, amount)),
                    MergeMode::Restore => {
                        entry.set(slot.clone(), device.clone(), amount);
                        None
                    }
                }
            };

            match rejection {
                None => touched.push((slot.clone(), device.clone(), amount)),
                Some(rejection) => match mode {
                    MergeMode::Apply => return Err(Report::new(rejection)),
                    MergeMode::Restore => {
                        tracing::warn!(%slot, %device, reason = %rejection, "skipping restored allocation entry");
                        report.skipped.push((slot.clone(), device.clone()));
                    }
                },
            }
        }

        if !entry.is_empty() {
            candidate.workloads.insert(owner.clone(), entry);
        }

        for (slot, device, amount) in touched {
            let Some(capacity) = self.capacity_of(&slot, &device) else {
                continue;
            };
            let Some(total) = candidate.checked_total(&slot, &device) else {
                match mode {
                    MergeMode::Apply => return Err(Report::new(invalid_amount(&slot, &device, amount))),
                    MergeMode::Restore => {
                        tracing::warn!(%slot, %device, %amount, "skipping restored allocation entry, total overflows");
                        if let Some(restored) = candidate.workloads.get_mut(owner) {
                            restored.set(slot.clone(), device.clone(), Decimal::ZERO);
                            if restored.is_empty() {
                                candidate.workloads.remove(owner);
                            }
                        }
                        report.skipped.push((slot, device));
                        continue;
                    }
                }
            };

            if mode == MergeMode::Restore {
                report.restored.set(slot.clone(), device.clone(), amount);
            }
            if total <= capacity {
                continue;
            }
            match mode {
                MergeMode::Apply => {
                    return Err(Report::new(AcceleratorError::OutOfCapacity {
                        slot,
                        device,
                        requested: total,
                        capacity,
                    }));
                }
                MergeMode::Restore => {
                    tracing::warn!(%slot, %device, %total, %capacity, "restored allocation exceeds device capacity");
                    report.overcommitted.push((slot, device));
                }
            }
        }

        self.state = candidate;
        Ok(report)
    }
}

fn invalid_amount(slot: &SlotName, device: &DeviceId, amount: Decimal) -> AcceleratorError {
    AcceleratorError::InvalidAmount {
        slot: slot.clone(),
        device: device.clone(),
        amount,
    }
}
