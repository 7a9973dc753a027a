//! Shared API type definitions
//!
//! This crate contains the data model exchanged between the accelerator
//! subsystem and the host agent: device descriptors, slot allocations, the
//! resource spec persisted with running containers, and measurement records.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;

/// Nil UUID reported for devices whose vendor UUID cannot be read.
pub const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Stable device index in its string form.
///
/// Ids that parse as integers are ordered numerically so that `"2"` sorts
/// before `"10"`; the raw string breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric index, if the id is an integer.
    pub fn index(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.index(), other.index()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        Self(index.to_string())
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Name of an allocatable resource dimension, e.g. `cuda.device` or `cuda.shares`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotName(String);

impl SlotName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identifier of the workload (container) owning an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkloadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// How a slot's capacity is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// One unit per device.
    Count,
    /// Fractional share of a device.
    Share,
}

/// Immutable record of one physical accelerator device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    /// Bus/topology location, vendor specific
    pub hw_location: String,
    /// NUMA node, absent when the topology cannot be determined
    pub numa_node: Option<u32>,
    /// Device memory in bytes
    pub memory_size: u64,
    /// Number of parallel compute units
    pub processing_units: u32,
    pub model_name: String,
    /// Vendor UUID, [`NIL_UUID`] when unavailable
    pub unique_id: String,
}

/// Per-device amounts of one slot.
pub type DeviceAmounts = BTreeMap<DeviceId, Decimal>;

/// Mapping of slot name to per-device allocated amount.
///
/// Zero amounts are never stored, so two maps describing the same
/// allocation compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<SlotName, DeviceAmounts>",
    into = "BTreeMap<SlotName, DeviceAmounts>"
)]
pub struct AllocationMap(BTreeMap<SlotName, DeviceAmounts>);

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, mainly for callers assembling a request.
    pub fn with(mut self, slot: impl Into<SlotName>, device: impl Into<DeviceId>, amount: Decimal) -> Self {
        self.set(slot.into(), device.into(), amount);
        self
    }

    pub fn get(&self, slot: &SlotName, device: &DeviceId) -> Decimal {
        self.0
            .get(slot)
            .and_then(|devices| devices.get(device))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Set an amount; a zero amount removes the entry.
    pub fn set(&mut self, slot: SlotName, device: DeviceId, amount: Decimal) {
        if amount.is_zero() {
            if let Some(devices) = self.0.get_mut(&slot) {
                devices.remove(&device);
                if devices.is_empty() {
                    self.0.remove(&slot);
                }
            }
            return;
        }
        self.0.entry(slot).or_default().insert(device, amount);
    }

    /// Add to an entry and return the new amount.
    ///
    /// Returns `None` and leaves the map unchanged when the sum overflows.
    pub fn checked_add(&mut self, slot: SlotName, device: DeviceId, amount: Decimal) -> Option<Decimal> {
        let total = self.get(&slot, &device).checked_add(amount)?;
        self.set(slot, device, total);
        Some(total)
    }

    /// Sum another map into this one.
    ///
    /// Returns the first entry whose sum overflows; entries before it have
    /// already been added.
    pub fn checked_merge_from(&mut self, other: &AllocationMap) -> Result<(), (SlotName, DeviceId)> {
        for (slot, device, amount) in other.iter() {
            if self.checked_add(slot.clone(), device.clone(), amount).is_none() {
                return Err((slot.clone(), device.clone()));
            }
        }
        Ok(())
    }

    pub fn slots(&self) -> impl Iterator<Item = (&SlotName, &DeviceAmounts)> {
        self.0.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotName, &DeviceId, Decimal)> {
        self.0.iter().flat_map(|(slot, devices)| {
            devices
                .iter()
                .map(move |(device, amount)| (slot, device, *amount))
        })
    }

    /// Devices holding a non-zero amount in any slot.
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.0
            .values()
            .flat_map(|devices| devices.keys().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<SlotName, DeviceAmounts>> for AllocationMap {
    fn from(slots: BTreeMap<SlotName, DeviceAmounts>) -> Self {
        let mut map = AllocationMap::new();
        for (slot, devices) in slots {
            for (device, amount) in devices {
                map.set(slot.clone(), device, amount);
            }
        }
        map
    }
}

impl From<AllocationMap> for BTreeMap<SlotName, DeviceAmounts> {
    fn from(map: AllocationMap) -> Self {
        map.0
    }
}

/// Allocation record persisted with a running container.
///
/// Keyed by device family (`cuda`, `tpu`), then slot name, then device id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSpec(BTreeMap<String, BTreeMap<SlotName, DeviceAmounts>>);

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, family: impl Into<String>, slots: BTreeMap<SlotName, DeviceAmounts>) {
        self.0.insert(family.into(), slots);
    }

    /// Allocation recorded for one device family, if any.
    pub fn family_allocation(&self, family: &str) -> Option<AllocationMap> {
        self.0.get(family).cloned().map(AllocationMap::from)
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Unit hint attached to a measurement for the stats consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitHint {
    Bytes,
    Percent,
}

/// Statistical reduction requested from the stats consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatKind {
    Avg,
    Max,
}

/// A `(current, capacity)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub current: Decimal,
    pub capacity: Decimal,
}

impl Measurement {
    pub fn new(current: Decimal, capacity: Decimal) -> Self {
        Self { current, capacity }
    }
}

impl std::ops::Add for Measurement {
    type Output = Measurement;

    fn add(self, rhs: Measurement) -> Measurement {
        Measurement {
            current: self.current + rhs.current,
            capacity: self.capacity + rhs.capacity,
        }
    }
}

/// One metric for one collection cycle: node aggregate plus per-device breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Metric key, e.g. `cuda_mem`
    pub key: String,
    pub unit_hint: UnitHint,
    pub stats: BTreeSet<StatKind>,
    pub per_node: Measurement,
    pub per_device: BTreeMap<DeviceId, Measurement>,
}

/// Per-container breakdown of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeasurement {
    pub key: String,
    pub unit_hint: UnitHint,
    pub per_container: BTreeMap<WorkloadId, Measurement>,
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_device_id_natural_order() {
        let mut ids: Vec<DeviceId> = ["10", "2", "tpu-a", "0", "1"]
            .into_iter()
            .map(DeviceId::from)
            .collect();
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(DeviceId::as_str).collect();
        assert_eq!(ids, vec!["0", "1", "2", "10", "tpu-a"]);
    }

    #[test]
    fn test_allocation_map_drops_zero_amounts() {
        let mut map = AllocationMap::new().with("cuda.shares", "0", dec!(0.5));
        map.checked_add(SlotName::from("cuda.shares"), DeviceId::from("0"), dec!(-0.5));
        assert!(map.is_empty());
        assert_eq!(map, AllocationMap::new());
    }

    #[test]
    fn test_allocation_map_overflow_leaves_entry() {
        let mut map = AllocationMap::new().with("cuda.shares", "0", dec!(0.5));
        let slot = SlotName::from("cuda.shares");
        let device = DeviceId::from("0");

        assert_eq!(map.checked_add(slot.clone(), device.clone(), Decimal::MAX), None);
        assert_eq!(map.get(&slot, &device), dec!(0.5));

        let other = AllocationMap::new().with("cuda.shares", "0", Decimal::MAX);
        assert_eq!(map.checked_merge_from(&other), Err((slot.clone(), device.clone())));
        assert_eq!(map.get(&slot, &device), dec!(0.5));
    }

    #[test]
    fn test_allocation_map_deserialize_drops_zero_amounts() {
        let map: AllocationMap = serde_json::from_str(
            r#"{ "cuda.shares": { "0": "0", "1": "0.25" }, "cuda.device": { "0": "0.00" } }"#,
        )
        .unwrap();
        assert_eq!(map, AllocationMap::new().with("cuda.shares", "1", dec!(0.25)));
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            serde_json::json!({ "cuda.shares": { "1": "0.25" } })
        );
    }

    #[test]
    fn test_allocation_map_devices() {
        let map = AllocationMap::new()
            .with("cuda.device", "2", dec!(1))
            .with("cuda.shares", "0", dec!(0.25))
            .with("cuda.shares", "2", dec!(0.75));
        let devices: Vec<String> = map.devices().iter().map(|d| d.to_string()).collect();
        assert_eq!(devices, vec!["0".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_resource_spec_from_json() {
        let spec: ResourceSpec = serde_json::from_str(
            r#"{
                "cuda": { "cuda.shares": { "0": "0.50", "1": 1.25 } },
                "tpu": { "tpu.device": { "0": "1" } }
            }"#,
        )
        .unwrap();

        let cuda = spec.family_allocation("cuda").unwrap();
        assert_eq!(
            cuda.get(&SlotName::from("cuda.shares"), &DeviceId::from("0")),
            dec!(0.5)
        );
        assert_eq!(
            cuda.get(&SlotName::from("cuda.shares"), &DeviceId::from("1")),
            dec!(1.25)
        );
        assert!(spec.family_allocation("rocm").is_none());
        assert_eq!(spec.families().collect::<Vec<_>>(), vec!["cuda", "tpu"]);
    }

    #[test]
    fn test_measurement_add() {
        let total = Measurement::new(dec!(1), dec!(4)) + Measurement::new(dec!(2), dec!(4));
        assert_eq!(total, Measurement::new(dec!(3), dec!(8)));
    }
}
