//! Accelerator plugin facade
//!
//! [`AcceleratorPlugin`] wires the inventory, the ledger task, the runtime
//! integration and the measurement collector together for one device
//! family. Bootstrap never fails because hardware or helpers are missing;
//! the plugin disables itself instead and answers every query with empty
//! results.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::AllocationMap;
use api_types::ContainerMeasurement;
use api_types::DeviceDescriptor;
use api_types::DeviceId;
use api_types::MeasurementRecord;
use api_types::ResourceSpec;
use api_types::SlotKind;
use api_types::SlotName;
use api_types::WorkloadId;
use error_stack::Report;
use error_stack::ResultExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::collector::MeasurementCollector;
use crate::collector::StatsDriver;
use crate::config::DeviceFamily;
use crate::config::PluginConfig;
use crate::error::AcceleratorError;
use crate::inventory::DeviceDriver;
use crate::inventory::Inventory;
use crate::ledger::AllocationLedger;
use crate::ledger::DeviceCountSlot;
use crate::ledger::FractionalShareSlot;
use crate::ledger::LedgerHandle;
use crate::ledger::RestoreReport;
use crate::ledger::SlotPolicy;
use crate::platform::CtpuDriver;
use crate::platform::NvmlDriver;
use crate::runtime::ContainerClient;
use crate::runtime::RuntimeArgs;
use crate::runtime::RuntimeArgsGenerator;
use crate::runtime::RuntimeIntegration;
use crate::share::ShareInfo;

/// Native drivers available on this host.
#[derive(Default, Clone)]
pub struct Drivers {
    pub devices: Option<Arc<dyn DeviceDriver>>,
    pub stats: Option<Arc<dyn StatsDriver>>,
}

impl Drivers {
    /// Load the drivers for the configured family; missing ones are left empty.
    pub fn load(config: &PluginConfig) -> Self {
        match config.family {
            DeviceFamily::Cuda => match NvmlDriver::init() {
                Ok(nvml) => {
                    let nvml = Arc::new(nvml);
                    let devices: Arc<dyn DeviceDriver> = nvml.clone();
                    let stats: Arc<dyn StatsDriver> = nvml;
                    Self {
                        devices: Some(devices),
                        stats: Some(stats),
                    }
                }
                Err(e) => {
                    warn!(error = ?e, "NVML unavailable");
                    Self::default()
                }
            },
            DeviceFamily::Tpu => {
                let devices: Arc<dyn DeviceDriver> =
                    Arc::new(CtpuDriver::new(&config.helper_binary, config.probe_timeout));
                Self {
                    devices: Some(devices),
                    stats: None,
                }
            }
        }
    }
}

/// Slot policies accounted for a family.
pub fn slot_policies(family: DeviceFamily, share: ShareInfo) -> Vec<Arc<dyn SlotPolicy>> {
    family
        .slots()
        .into_iter()
        .map(|(slot, kind)| -> Arc<dyn SlotPolicy> {
            match kind {
                SlotKind::Count => Arc::new(DeviceCountSlot::new(slot)),
                SlotKind::Share => Arc::new(FractionalShareSlot::new(slot, share)),
            }
        })
        .collect()
}

struct Enabled {
    inventory: Arc<Inventory>,
    ledger: LedgerHandle,
    runtime: RuntimeIntegration,
    slot_types: BTreeMap<SlotName, SlotKind>,
}

enum PluginState {
    Enabled(Enabled),
    Disabled { reason: String },
}

pub struct AcceleratorPlugin {
    config: PluginConfig,
    share: ShareInfo,
    collector: MeasurementCollector,
    state: PluginState,
}

impl AcceleratorPlugin {
    /// Detect the runtime integration, list devices and start the ledger.
    ///
    /// Only an invalid configuration is an error.
    #[tracing::instrument(skip_all, fields(family = %config.family))]
    pub async fn bootstrap(
        config: PluginConfig,
        drivers: Drivers,
        containers: Arc<dyn ContainerClient>,
    ) -> Result<Self, Report<AcceleratorError>> {
        let share = ShareInfo::new(config.share_units)?;

        let state = match Self::enable(&config, share, drivers.devices, containers).await {
            Ok(enabled) => PluginState::Enabled(enabled),
            Err(reason) => {
                warn!(%reason, "accelerator plugin disabled");
                PluginState::Disabled { reason }
            }
        };

        let stats = match &state {
            PluginState::Enabled(_) => drivers.stats,
            PluginState::Disabled { .. } => None,
        };
        let collector = MeasurementCollector::new(config.family, stats, config.device_mask.clone())
            .with_query_timeout(config.probe_timeout);

        Ok(Self {
            config,
            share,
            collector,
            state,
        })
    }

    /// Returns the reason the plugin is disabled on failure.
    async fn enable(
        config: &PluginConfig,
        share: ShareInfo,
        driver: Option<Arc<dyn DeviceDriver>>,
        containers: Arc<dyn ContainerClient>,
    ) -> Result<Enabled, String> {
        let runtime = RuntimeIntegration::resolve(config, containers).await;
        if let RuntimeIntegration::Disabled { reason } = &runtime {
            return Err(reason.clone());
        }

        let driver = driver.ok_or_else(|| {
            AcceleratorError::DriverUnavailable {
                driver: config.family.to_string(),
            }
            .to_string()
        })?;
        let inventory = Arc::new(Inventory::new(
            driver,
            config.device_mask.clone(),
            &config.sysfs_root,
        ));
        let devices = list_devices_blocking(&inventory, config.probe_timeout)
            .await
            .map_err(|e| {
                warn!(error = ?e, "device enumeration failed");
                e.current_context().to_string()
            })?;

        let ledger = AllocationLedger::new(slot_policies(config.family, share), &devices);
        let slot_types = ledger.slot_types();
        let (ledger, _task) = LedgerHandle::spawn(ledger);

        info!(
            devices = devices.len(),
            runtime = runtime.name(),
            "accelerator plugin enabled"
        );
        Ok(Enabled {
            inventory,
            ledger,
            runtime,
            slot_types,
        })
    }

    fn enabled(&self) -> Result<&Enabled, Report<AcceleratorError>> {
        match &self.state {
            PluginState::Enabled(enabled) => Ok(enabled),
            PluginState::Disabled { reason } => Err(Report::new(AcceleratorError::Disabled {
                reason: reason.clone(),
            })),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, PluginState::Enabled(_))
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        match &self.state {
            PluginState::Enabled(_) => None,
            PluginState::Disabled { reason } => Some(reason),
        }
    }

    pub fn slot_types(&self) -> BTreeMap<SlotName, SlotKind> {
        match &self.state {
            PluginState::Enabled(enabled) => enabled.slot_types.clone(),
            PluginState::Disabled { .. } => BTreeMap::new(),
        }
    }

    pub fn share_info(&self) -> &ShareInfo {
        &self.share
    }

    pub fn runtime(&self) -> Option<&RuntimeIntegration> {
        match &self.state {
            PluginState::Enabled(enabled) => Some(&enabled.runtime),
            PluginState::Disabled { .. } => None,
        }
    }

    /// Re-query the driver and refresh ledger capacity from the result.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, Report<AcceleratorError>> {
        let PluginState::Enabled(enabled) = &self.state else {
            return Ok(Vec::new());
        };
        self.refresh(enabled).await
    }

    async fn refresh(&self, enabled: &Enabled) -> Result<Vec<DeviceDescriptor>, Report<AcceleratorError>> {
        let devices = list_devices_blocking(&enabled.inventory, self.config.probe_timeout).await?;
        enabled.ledger.sync_devices(devices.clone()).await?;
        Ok(devices)
    }

    /// Capacity per slot over the devices currently listed.
    pub async fn available_slots(
        &self,
    ) -> Result<BTreeMap<SlotName, Decimal>, Report<AcceleratorError>> {
        let PluginState::Enabled(enabled) = &self.state else {
            return Ok(BTreeMap::new());
        };
        self.refresh(enabled).await?;
        enabled.ledger.available_slots().await
    }

    pub async fn allocate(
        &self,
        owner: WorkloadId,
        allocation: AllocationMap,
    ) -> Result<(), Report<AcceleratorError>> {
        self.enabled()?.ledger.apply(owner, allocation).await
    }

    /// Allocate the share covering a raw memory/processing request on `device`.
    ///
    /// Returns the allocated share.
    pub async fn allocate_request(
        &self,
        owner: WorkloadId,
        device: DeviceId,
        memory: Decimal,
        processing: Decimal,
    ) -> Result<Decimal, Report<AcceleratorError>> {
        let enabled = self.enabled()?;
        let share = self.share.spec_to_share(memory, processing);
        let [_, (share_slot, _)] = self.config.family.slots();

        enabled
            .ledger
            .apply(owner, AllocationMap::new().with(share_slot, device, share))
            .await?;
        Ok(share)
    }

    /// Entries for devices missing from a fresh listing are skipped.
    pub async fn restore_from_external_spec(
        &self,
        owner: WorkloadId,
        spec: ResourceSpec,
    ) -> Result<RestoreReport, Report<AcceleratorError>> {
        let enabled = self.enabled()?;
        self.refresh(enabled).await?;
        enabled
            .ledger
            .restore_from_external_spec(owner, self.config.family.key().to_string(), spec)
            .await
    }

    pub async fn release(
        &self,
        owner: WorkloadId,
    ) -> Result<Option<AllocationMap>, Report<AcceleratorError>> {
        self.enabled()?.ledger.release(owner).await
    }

    /// Node-wide allocation totals.
    pub async fn allocations(&self) -> Result<AllocationMap, Report<AcceleratorError>> {
        match &self.state {
            PluginState::Enabled(enabled) => enabled.ledger.allocations().await,
            PluginState::Disabled { .. } => Ok(AllocationMap::new()),
        }
    }

    /// Container parameters exposing the devices allocated to `owner`.
    #[tracing::instrument(skip_all, fields(owner = %owner))]
    pub async fn generate_runtime_args(
        &self,
        owner: &WorkloadId,
    ) -> Result<RuntimeArgs, Report<AcceleratorError>> {
        let PluginState::Enabled(enabled) = &self.state else {
            return Ok(RuntimeArgs::default());
        };

        let active: BTreeSet<DeviceId> = enabled
            .ledger
            .allocation_of(owner.clone())
            .await?
            .devices()
            .into_iter()
            .filter(|device| !self.config.device_mask.contains(device))
            .collect();

        enabled
            .runtime
            .generate(&active)
            .await
            .attach_printable_lazy(|| format!("runtime integration: {}", enabled.runtime.name()))
    }

    pub async fn gather_node_measurements(&self) -> Vec<MeasurementRecord> {
        self.collector.gather_node_measurements().await
    }

    pub fn gather_container_measurements(
        &self,
        containers: &[WorkloadId],
    ) -> Vec<ContainerMeasurement> {
        self.collector.gather_container_measurements(containers)
    }

    /// Run the collector on the configured interval until `cancellation_token` fires.
    pub fn spawn_collector(
        &self,
        cancellation_token: CancellationToken,
        sink: mpsc::Sender<Vec<MeasurementRecord>>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.collector.clone().run(
            self.config.collect_interval,
            cancellation_token,
            sink,
        ))
    }
}

async fn list_devices_blocking(
    inventory: &Arc<Inventory>,
    timeout: Duration,
) -> Result<Vec<DeviceDescriptor>, Report<AcceleratorError>> {
    let inventory = inventory.clone();
    let listing = tokio::task::spawn_blocking(move || inventory.list_devices());
    tokio::time::timeout(timeout, listing)
        .await
        .change_context_lazy(|| AcceleratorError::DeviceQuery {
            message: format!("device enumeration timed out after {timeout:?}"),
        })?
        .change_context(AcceleratorError::DeviceQuery {
            message: "device enumeration worker failed".to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use api_types::Measurement;
    use rust_decimal_macros::dec;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::collector::DeviceStats;
    use crate::config::DeviceMask;
    use crate::inventory::DeviceProperties;
    use crate::testing::MockContainerClient;
    use crate::testing::MockDeviceDriver;
    use crate::testing::MockStatsDriver;

    const GIB: u64 = 1 << 30;

    fn props(index: u32) -> DeviceProperties {
        DeviceProperties {
            index,
            pci_bus_id: None,
            hw_location: format!("n1-standard-2@tpu-{index}"),
            memory_size: 4 * GIB,
            processing_units: 1,
            model_name: "Cloud TPU".to_string(),
            uuid: None,
        }
    }

    fn tpu_config(mask: &str) -> PluginConfig {
        let mut config = PluginConfig::for_family(DeviceFamily::Tpu);
        config.device_mask = DeviceMask::parse(mask);
        config.sysfs_root = "/nonexistent".into();
        config
    }

    fn drivers(driver: Arc<MockDeviceDriver>) -> Drivers {
        let stats: Arc<dyn StatsDriver> = Arc::new(MockStatsDriver::with_stats(vec![DeviceStats {
            device_id: DeviceId::from("0"),
            memory_used: GIB,
            memory_total: 4 * GIB,
            utilization_percent: 40,
        }]));
        let devices: Arc<dyn DeviceDriver> = driver;
        Drivers {
            devices: Some(devices),
            stats: Some(stats),
        }
    }

    async fn tpu_plugin(mask: &str, count: u32) -> (AcceleratorPlugin, Arc<MockDeviceDriver>) {
        let driver = Arc::new(MockDeviceDriver::with_devices((0..count).map(props).collect()));
        let plugin = AcceleratorPlugin::bootstrap(
            tpu_config(mask),
            drivers(driver.clone()),
            Arc::new(MockContainerClient::default()),
        )
        .await
        .unwrap();
        (plugin, driver)
    }

    fn owner(id: &str) -> WorkloadId {
        WorkloadId::from(id)
    }

    #[tokio::test]
    async fn test_bootstrap_enables_plugin() {
        let (plugin, _) = tpu_plugin("", 2).await;

        assert!(plugin.is_enabled());
        assert_eq!(plugin.disabled_reason(), None);
        assert_eq!(
            plugin.slot_types(),
            BTreeMap::from([
                (SlotName::from("tpu.device"), SlotKind::Count),
                (SlotName::from("tpu.shares"), SlotKind::Share),
            ])
        );
        // min(4 GiB / 2 GiB, 1 core / 1 core) = 1 share per device
        assert_eq!(
            plugin.available_slots().await.unwrap(),
            BTreeMap::from([
                (SlotName::from("tpu.device"), dec!(2)),
                (SlotName::from("tpu.shares"), dec!(2)),
            ])
        );
    }

    #[tokio::test]
    async fn test_masked_devices_are_never_exposed() {
        let (plugin, _) = tpu_plugin("1", 3).await;

        let ids: BTreeSet<DeviceId> = plugin
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert!(!ids.contains(&DeviceId::from("1")));
        assert_eq!(
            plugin.available_slots().await.unwrap()[&SlotName::from("tpu.device")],
            dec!(2)
        );

        let err = plugin
            .allocate(owner("a"), AllocationMap::new().with("tpu.device", "1", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), AcceleratorError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_allocate_request_rounds_up() {
        let (plugin, _) = tpu_plugin("", 1).await;

        let share = plugin
            .allocate_request(owner("a"), DeviceId::from("0"), Decimal::from(GIB + 1), dec!(0))
            .await
            .unwrap();
        assert_eq!(share, dec!(0.51));
        assert_eq!(
            plugin
                .allocations()
                .await
                .unwrap()
                .get(&SlotName::from("tpu.shares"), &DeviceId::from("0")),
            dec!(0.51)
        );
    }

    #[tokio::test]
    async fn test_runtime_args_follow_allocation() {
        let (plugin, _) = tpu_plugin("", 3).await;
        plugin
            .allocate(
                owner("a"),
                AllocationMap::new()
                    .with("tpu.device", "2", dec!(1))
                    .with("tpu.shares", "0", dec!(0.5)),
            )
            .await
            .unwrap();

        let args = plugin.generate_runtime_args(&owner("a")).await.unwrap();
        assert_eq!(args.env[0], "TPU_VISIBLE_DEVICES=0,2");
        assert!(args.env[1].starts_with("TPU_NAME="));

        let args = plugin.generate_runtime_args(&owner("b")).await.unwrap();
        assert!(args.is_empty());

        plugin.release(owner("a")).await.unwrap();
        assert!(plugin.generate_runtime_args(&owner("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let (plugin, _) = tpu_plugin("", 2).await;
        let spec: ResourceSpec = serde_json::from_value(serde_json::json!({
            "tpu": {"tpu.shares": {"0": "0.75", "4": "1"}},
            "cuda": {"cuda.shares": {"0": "1"}},
        }))
        .unwrap();

        let report = plugin
            .restore_from_external_spec(owner("a"), spec.clone())
            .await
            .unwrap();
        plugin.restore_from_external_spec(owner("a"), spec).await.unwrap();

        assert_eq!(report.skipped, vec![(SlotName::from("tpu.shares"), DeviceId::from("4"))]);
        assert_eq!(
            plugin.allocations().await.unwrap(),
            AllocationMap::new().with("tpu.shares", "0", dec!(0.75))
        );
    }

    #[tokio::test]
    async fn test_hot_removed_device_drops_capacity() {
        let (plugin, driver) = tpu_plugin("", 2).await;
        driver.set_devices(vec![props(0)]);

        assert_eq!(
            plugin.available_slots().await.unwrap(),
            BTreeMap::from([
                (SlotName::from("tpu.device"), dec!(1)),
                (SlotName::from("tpu.shares"), dec!(1)),
            ])
        );
        assert_eq!(plugin.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_available_slots_exclude_masked_devices_after_relisting() {
        let (plugin, driver) = tpu_plugin("2", 3).await;
        driver.set_devices((0..4).map(props).collect());

        assert_eq!(
            plugin.available_slots().await.unwrap()[&SlotName::from("tpu.device")],
            dec!(3)
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_restore_skips_hot_removed_device() {
        let (plugin, driver) = tpu_plugin("", 2).await;
        driver.set_devices(vec![props(0)]);
        let spec: ResourceSpec = serde_json::from_value(serde_json::json!({
            "tpu": {"tpu.device": {"0": "1", "1": "1"}},
        }))
        .unwrap();

        let report = plugin.restore_from_external_spec(owner("a"), spec).await.unwrap();

        assert_eq!(report.skipped, vec![(SlotName::from("tpu.device"), DeviceId::from("1"))]);
        assert_eq!(report.restored, AllocationMap::new().with("tpu.device", "0", dec!(1)));
        assert_eq!(
            plugin.allocations().await.unwrap(),
            AllocationMap::new().with("tpu.device", "0", dec!(1))
        );
    }

    struct HangingDriver;

    impl DeviceDriver for HangingDriver {
        fn name(&self) -> &str {
            "hanging"
        }

        fn enumerate(&self) -> Result<Vec<DeviceProperties>, Report<AcceleratorError>> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(vec![props(0)])
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_hung_enumeration_disables_plugin() {
        let mut config = tpu_config("");
        config.probe_timeout = Duration::from_millis(100);

        let plugin = AcceleratorPlugin::bootstrap(
            config,
            Drivers {
                devices: Some(Arc::new(HangingDriver)),
                stats: None,
            },
            Arc::new(MockContainerClient::default()),
        )
        .await
        .unwrap();

        assert!(!plugin.is_enabled());
        assert!(plugin
            .disabled_reason()
            .is_some_and(|reason| reason.contains("timed out")));
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_driver_disables_plugin() {
        let plugin = AcceleratorPlugin::bootstrap(
            tpu_config(""),
            Drivers {
                devices: Some(Arc::new(MockDeviceDriver::unavailable())),
                stats: None,
            },
            Arc::new(MockContainerClient::default()),
        )
        .await
        .unwrap();

        assert!(!plugin.is_enabled());
        assert!(plugin
            .disabled_reason()
            .is_some_and(|reason| reason.contains("unavailable")));
        assert!(plugin.list_devices().await.unwrap().is_empty());
        assert!(plugin.available_slots().await.unwrap().is_empty());
        assert!(plugin.slot_types().is_empty());
        assert!(plugin.generate_runtime_args(&owner("a")).await.unwrap().is_empty());

        let err = plugin
            .allocate(owner("a"), AllocationMap::new().with("tpu.device", "0", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), AcceleratorError::Disabled { .. }));

        for record in plugin.gather_node_measurements().await {
            assert_eq!(record.per_node, Measurement::default());
            assert!(record.per_device.is_empty());
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_helper_disables_cuda_plugin() {
        let mut config = PluginConfig::for_family(DeviceFamily::Cuda);
        config.helper_binary = "/nonexistent/nvidia-docker".into();
        let driver = Arc::new(MockDeviceDriver::with_devices(vec![props(0)]));

        let plugin = AcceleratorPlugin::bootstrap(
            config,
            drivers(driver),
            Arc::new(MockContainerClient::default()),
        )
        .await
        .unwrap();

        assert!(!plugin.is_enabled());
        assert!(plugin.runtime().is_none());
        assert!(plugin.available_slots().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cuda_runtime_flag_integration() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let helper = dir.path().join("nvidia-docker");
        std::fs::write(&helper, "#!/bin/sh\necho 'NVIDIA Docker: 2.0.3'\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = PluginConfig::for_family(DeviceFamily::Cuda);
        config.helper_binary = helper;
        config.sysfs_root = "/nonexistent".into();
        let driver = Arc::new(MockDeviceDriver::with_devices((0..3).map(props).collect()));

        let plugin = AcceleratorPlugin::bootstrap(
            config,
            drivers(driver),
            Arc::new(MockContainerClient::default()),
        )
        .await
        .unwrap();
        assert_eq!(plugin.runtime().map(RuntimeIntegration::name), Some("runtime-flag"));

        plugin
            .allocate(
                owner("a"),
                AllocationMap::new()
                    .with("cuda.device", "2", dec!(1))
                    .with("cuda.device", "0", dec!(1)),
            )
            .await
            .unwrap();

        let args = plugin.generate_runtime_args(&owner("a")).await.unwrap();
        assert_eq!(args.env, vec!["NVIDIA_VISIBLE_DEVICES=0,2".to_string()]);
        assert_eq!(args.runtime.as_deref(), Some("nvidia"));

        let records = plugin.gather_node_measurements().await;
        assert_eq!(records[0].key, "cuda_mem");
        assert_eq!(records[1].per_device[&DeviceId::from("0")].current, dec!(40));
    }
}
