//! Serialized access to the ledger.
//!
//! The ledger is owned by a single task; all mutations and reads are sent to
//! it as commands so concurrent callers never observe a partial update.

use std::collections::BTreeMap;

use api_types::AllocationMap;
use api_types::DeviceDescriptor;
use api_types::ResourceSpec;
use api_types::SlotName;
use api_types::WorkloadId;
use error_stack::Report;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::AllocationLedger;
use super::LedgerState;
use super::RestoreReport;
use crate::error::AcceleratorError;

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<T>;

enum LedgerCommand {
    Apply {
        owner: WorkloadId,
        allocation: AllocationMap,
        reply: Reply<Result<(), Report<AcceleratorError>>>,
    },
    Restore {
        owner: WorkloadId,
        family: String,
        spec: ResourceSpec,
        reply: Reply<RestoreReport>,
    },
    Release {
        owner: WorkloadId,
        reply: Reply<Option<AllocationMap>>,
    },
    SyncDevices {
        devices: Vec<DeviceDescriptor>,
        reply: Reply<()>,
    },
    AvailableSlots {
        reply: Reply<BTreeMap<SlotName, Decimal>>,
    },
    Allocations {
        reply: Reply<AllocationMap>,
    },
    AllocationOf {
        owner: WorkloadId,
        reply: Reply<AllocationMap>,
    },
    Snapshot {
        reply: Reply<LedgerState>,
    },
}

impl AllocationLedger {
    fn handle(&mut self, command: LedgerCommand) {
        // a dropped receiver means the caller gave up waiting
        match command {
            LedgerCommand::Apply {
                owner,
                allocation,
                reply,
            } => {
                let _ = reply.send(self.apply(&owner, &allocation));
            }
            LedgerCommand::Restore {
                owner,
                family,
                spec,
                reply,
            } => {
                let _ = reply.send(self.restore_from_external_spec(&owner, &family, &spec));
            }
            LedgerCommand::Release { owner, reply } => {
                let _ = reply.send(self.release(&owner));
            }
            LedgerCommand::SyncDevices { devices, reply } => {
                self.sync_devices(&devices);
                let _ = reply.send(());
            }
            LedgerCommand::AvailableSlots { reply } => {
                let _ = reply.send(self.available_slots());
            }
            LedgerCommand::Allocations { reply } => {
                let _ = reply.send(self.allocations());
            }
            LedgerCommand::AllocationOf { owner, reply } => {
                let _ = reply.send(self.allocation_of(&owner));
            }
            LedgerCommand::Snapshot { reply } => {
                let _ = reply.send(self.state().clone());
            }
        }
    }
}

/// Cloneable handle to a ledger running in its own task.
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerCommand>,
}

impl LedgerHandle {
    /// Move `ledger` into a new task. The task exits once every handle is dropped.
    pub fn spawn(mut ledger: AllocationLedger) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                ledger.handle(command);
            }
            tracing::debug!("ledger task stopped");
        });
        (Self { sender }, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> LedgerCommand,
    ) -> Result<T, Report<AcceleratorError>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| Report::new(AcceleratorError::LedgerClosed))?;
        response
            .await
            .map_err(|_| Report::new(AcceleratorError::LedgerClosed))
    }

    pub async fn apply(
        &self,
        owner: WorkloadId,
        allocation: AllocationMap,
    ) -> Result<(), Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::Apply {
            owner,
            allocation,
            reply,
        })
        .await?
    }

    pub async fn restore_from_external_spec(
        &self,
        owner: WorkloadId,
        family: String,
        spec: ResourceSpec,
    ) -> Result<RestoreReport, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::Restore {
            owner,
            family,
            spec,
            reply,
        })
        .await
    }

    pub async fn release(
        &self,
        owner: WorkloadId,
    ) -> Result<Option<AllocationMap>, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::Release { owner, reply })
            .await
    }

    pub async fn sync_devices(
        &self,
        devices: Vec<DeviceDescriptor>,
    ) -> Result<(), Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::SyncDevices { devices, reply })
            .await
    }

    pub async fn available_slots(
        &self,
    ) -> Result<BTreeMap<SlotName, Decimal>, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::AvailableSlots { reply })
            .await
    }

    pub async fn allocations(&self) -> Result<AllocationMap, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::Allocations { reply })
            .await
    }

    pub async fn allocation_of(
        &self,
        owner: WorkloadId,
    ) -> Result<AllocationMap, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::AllocationOf { owner, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<LedgerState, Report<AcceleratorError>> {
        self.request(|reply| LedgerCommand::Snapshot { reply })
            .await
    }
}
