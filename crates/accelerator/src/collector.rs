//! Device utilization measurements
//!
//! Samples memory usage and utilization from the statistics driver and turns
//! them into [`MeasurementRecord`]s keyed `<family>_mem` and `<family>_util`.
//! A missing or failing driver yields zeroed records rather than an error.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::ContainerMeasurement;
use api_types::DeviceId;
use api_types::Measurement;
use api_types::MeasurementRecord;
use api_types::StatKind;
use api_types::UnitHint;
use api_types::WorkloadId;
use error_stack::Report;
use rust_decimal::Decimal;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::DeviceFamily;
use crate::config::DeviceMask;
use crate::error::AcceleratorError;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const UTILIZATION_CAPACITY: Decimal = Decimal::ONE_HUNDRED;

/// Live statistics of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    pub device_id: DeviceId,
    pub memory_used: u64,
    pub memory_total: u64,
    /// 0..=100
    pub utilization_percent: u32,
}

/// Source of live device statistics.
///
/// Implementations block; the collector calls them on a blocking worker.
pub trait StatsDriver: Send + Sync {
    fn name(&self) -> &str;

    fn device_stats(&self) -> Result<Vec<DeviceStats>, Report<AcceleratorError>>;
}

type StatsQuery = JoinHandle<Result<Vec<DeviceStats>, Report<AcceleratorError>>>;

#[derive(Clone)]
pub struct MeasurementCollector {
    family: DeviceFamily,
    driver: Option<Arc<dyn StatsDriver>>,
    mask: DeviceMask,
    query_timeout: Duration,
    /// Query that outlived its timeout and may still hold a blocking worker.
    stalled: Arc<Mutex<Option<StatsQuery>>>,
}

impl MeasurementCollector {
    pub fn new(
        family: DeviceFamily,
        driver: Option<Arc<dyn StatsDriver>>,
        mask: DeviceMask,
    ) -> Self {
        Self {
            family,
            driver,
            mask,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            stalled: Arc::default(),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn memory_key(&self) -> String {
        format!("{}_mem", self.family.key())
    }

    pub fn utilization_key(&self) -> String {
        format!("{}_util", self.family.key())
    }

    /// Node and per-device measurements, sampled off the runtime threads.
    ///
    /// While a timed-out query is still running no new one is started and
    /// the cycle reports zeroed records.
    pub async fn gather_node_measurements(&self) -> Vec<MeasurementRecord> {
        let Some(driver) = self.driver.clone() else {
            return self.build_records(&[]);
        };

        {
            let mut stalled = self.stalled.lock().unwrap_or_else(PoisonError::into_inner);
            if stalled.as_ref().is_some_and(|query| !query.is_finished()) {
                warn!("previous device statistics query still running, skipping cycle");
                return self.build_records(&[]);
            }
            *stalled = None;
        }

        let mut query = tokio::task::spawn_blocking(move || driver.device_stats());
        let stats = match tokio::time::timeout(self.query_timeout, &mut query).await {
            Ok(Ok(Ok(stats))) => stats,
            Ok(Ok(Err(e))) => {
                warn!(error = ?e, "failed to read device statistics");
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "device statistics worker failed");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout = ?self.query_timeout, "device statistics query timed out");
                *self.stalled.lock().unwrap_or_else(PoisonError::into_inner) = Some(query);
                Vec::new()
            }
        };

        self.build_records(&stats)
    }

    /// The drivers expose no per-container breakdown.
    pub fn gather_container_measurements(
        &self,
        _containers: &[WorkloadId],
    ) -> Vec<ContainerMeasurement> {
        Vec::new()
    }

    pub(crate) fn build_records(&self, stats: &[DeviceStats]) -> Vec<MeasurementRecord> {
        let mut memory = BTreeMap::new();
        let mut utilization = BTreeMap::new();

        for stat in stats.iter().filter(|s| !self.mask.contains(&s.device_id)) {
            memory.insert(
                stat.device_id.clone(),
                Measurement::new(Decimal::from(stat.memory_used), Decimal::from(stat.memory_total)),
            );
            utilization.insert(
                stat.device_id.clone(),
                Measurement::new(Decimal::from(stat.utilization_percent), UTILIZATION_CAPACITY),
            );
        }

        vec![
            record(self.memory_key(), UnitHint::Bytes, memory),
            record(self.utilization_key(), UnitHint::Percent, utilization),
        ]
    }

    /// Sample every `interval` until cancelled, forwarding records to `sink`.
    ///
    /// A full sink drops the cycle's records instead of delaying the next one.
    #[tracing::instrument(skip(self, cancellation_token, sink), fields(family = %self.family))]
    pub async fn run(
        self,
        interval: Duration,
        cancellation_token: CancellationToken,
        sink: mpsc::Sender<Vec<MeasurementRecord>>,
    ) {
        info!("Starting measurement collector");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Measurement collector shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let records = self.gather_node_measurements().await;
            emit_metrics(&records);

            match sink.try_send(records) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("measurement sink is full, dropping cycle");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("measurement sink closed");
                    break;
                }
            }
        }
    }
}

fn record(
    key: String,
    unit_hint: UnitHint,
    per_device: BTreeMap<DeviceId, Measurement>,
) -> MeasurementRecord {
    let per_node = per_device
        .values()
        .copied()
        .fold(Measurement::default(), |acc, m| acc + m);
    MeasurementRecord {
        key,
        unit_hint,
        stats: BTreeSet::from([StatKind::Avg, StatKind::Max]),
        per_node,
        per_device,
    }
}

fn emit_metrics(records: &[MeasurementRecord]) {
    for record in records {
        for (device, measurement) in &record.per_device {
            tracing::info!(
                target: "metrics.accelerator_device",
                tag_key = %record.key,
                tag_device = %device,
                current = %measurement.current,
                capacity = %measurement.capacity,
            );
        }
        tracing::info!(
            target: "metrics.accelerator_node",
            tag_key = %record.key,
            current = %record.per_node.current,
            capacity = %record.per_node.capacity,
        );
    }
}
