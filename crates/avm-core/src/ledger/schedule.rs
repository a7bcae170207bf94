use serde::{Deserialize, Serialize};

use crate::constants::energy;

/// One chargeable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyCharge {
    /// An executed instruction.
    Instruction,
    /// A container `get`, `set` or `length` call.
    ContainerAccess,
    /// Allocation of an object with `elements` fields, or of a container with `elements`
    /// elements.
    Allocation {
        /// Fields or elements allocated.
        elements: u64,
    },
    /// A method invocation.
    Invoke,
    /// A host native call.
    Native,
    /// Reading one persisted record of `bytes` bytes.
    StorageRead {
        /// Record size.
        bytes: u64,
    },
    /// Writing a record that did not exist before.
    WriteNew {
        /// Record size.
        bytes: u64,
    },
    /// Overwriting a record with different bytes.
    WriteUpdate {
        /// Record size.
        bytes: u64,
    },
    /// Reclaiming `instances` unreachable objects. This is a credit.
    Reclaim {
        /// Instances reclaimed.
        instances: u64,
    },
    /// Storing `bytes` bytes of contract code.
    CodeDeposit {
        /// Code size.
        bytes: u64,
    },
}

/// The category a charge is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum EnergyCategory {
    /// Execution and allocation.
    #[display("compute")]
    Compute,
    /// Record reads.
    #[display("storage_read")]
    StorageRead,
    /// Record and code writes.
    #[display("storage_write")]
    StorageWrite,
    /// Reclamation credits.
    #[display("reclaim")]
    Reclaim,
}

impl EnergyCharge {
    /// The category the charge is accounted under.
    pub const fn category(&self) -> EnergyCategory {
        match self {
            Self::Instruction |
            Self::ContainerAccess |
            Self::Allocation { .. } |
            Self::Invoke |
            Self::Native => EnergyCategory::Compute,
            Self::StorageRead { .. } => EnergyCategory::StorageRead,
            Self::WriteNew { .. } | Self::WriteUpdate { .. } | Self::CodeDeposit { .. } => {
                EnergyCategory::StorageWrite
            }
            Self::Reclaim { .. } => EnergyCategory::Reclaim,
        }
    }
}

/// The price list of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergySchedule {
    /// Per executed instruction.
    pub instruction: u64,
    /// Per container access.
    pub container_access: u64,
    /// Base cost of an allocation.
    pub allocation_base: u64,
    /// Per allocated field or element.
    pub allocation_per_element: u64,
    /// Per method invocation.
    pub invoke: u64,
    /// Per host native call.
    pub native: u64,
    /// Fixed cost of a record read.
    pub fixed_read: u64,
    /// Per byte read.
    pub byte_read: u64,
    /// Fixed cost of writing a new record.
    pub write_new: u64,
    /// Fixed cost of overwriting a record.
    pub write_update: u64,
    /// Per byte written.
    pub byte_write: u64,
    /// Credit per reclaimed instance.
    pub reclaim_credit: u64,
    /// Per byte of deployed code.
    pub code_deposit_byte: u64,
}

impl Default for EnergySchedule {
    fn default() -> Self {
        Self {
            instruction: energy::INSTRUCTION_COST,
            container_access: energy::CONTAINER_ACCESS_COST,
            allocation_base: energy::ALLOCATION_BASE_COST,
            allocation_per_element: energy::ALLOCATION_PER_ELEMENT_COST,
            invoke: energy::INVOKE_COST,
            native: energy::NATIVE_COST,
            fixed_read: energy::FIXED_READ_COST,
            byte_read: energy::BYTE_READ_COST,
            write_new: energy::PER_OBJECT_WRITE_NEW,
            write_update: energy::PER_OBJECT_WRITE_UPDATE,
            byte_write: energy::BYTE_WRITE_COST,
            reclaim_credit: energy::RECLAIM_CREDIT,
            code_deposit_byte: energy::CODE_DEPOSIT_BYTE_COST,
        }
    }
}

impl EnergySchedule {
    /// The magnitude of a charge. Reclamation is a credit of this amount, everything else a
    /// debit. Saturates instead of wrapping.
    pub const fn cost(&self, charge: EnergyCharge) -> u64 {
        match charge {
            EnergyCharge::Instruction => self.instruction,
            EnergyCharge::ContainerAccess => self.container_access,
            EnergyCharge::Allocation { elements } => self
                .allocation_base
                .saturating_add(self.allocation_per_element.saturating_mul(elements)),
            EnergyCharge::Invoke => self.invoke,
            EnergyCharge::Native => self.native,
            EnergyCharge::StorageRead { bytes } => {
                self.fixed_read.saturating_add(self.byte_read.saturating_mul(bytes))
            }
            EnergyCharge::WriteNew { bytes } => {
                self.write_new.saturating_add(self.byte_write.saturating_mul(bytes))
            }
            EnergyCharge::WriteUpdate { bytes } => {
                self.write_update.saturating_add(self.byte_write.saturating_mul(bytes))
            }
            EnergyCharge::Reclaim { instances } => self.reclaim_credit.saturating_mul(instances),
            EnergyCharge::CodeDeposit { bytes } => self.code_deposit_byte.saturating_mul(bytes),
        }
    }
}
