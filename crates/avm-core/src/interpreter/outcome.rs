use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    persistence::PersistenceError, EnergyUsage, ResourceExhaustion, StaticRejection,
    StorageError, StreamCorruption, Value,
};

/// How an invocation ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum InvocationStatus {
    /// Returned normally; writes are committed.
    Success,
    /// Threw out of the entry point or reverted explicitly; writes are discarded.
    Revert,
    /// Ran out of energy; writes are discarded and the whole budget is charged.
    OutOfResources,
    /// Hit a consistency failure in persisted state, code or storage; writes are discarded.
    RejectedAtRuntime,
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationFailure {
    /// An exception escaped the entry point.
    #[error("uncaught exception {class}")]
    Uncaught {
        /// The exception's class.
        class: String,
    },
    /// The contract called `revert()`.
    #[error("reverted by contract")]
    Reverted,
    /// Too many frames were live in one contract activation.
    #[error("frame depth limit exceeded: limit={limit}")]
    FrameDepthExceeded {
        /// The ceiling.
        limit: usize,
    },
    /// Cross-contract calls nested too deep.
    #[error("call depth limit exceeded: limit={limit}")]
    CallDepthExceeded {
        /// The ceiling.
        limit: usize,
    },
    /// A reference crossed a contract boundary.
    #[error("reference passed to or returned from contract {address}")]
    ForeignReference {
        /// The other contract.
        address: Address,
    },
    /// The energy budget was exhausted.
    #[error(transparent)]
    Exhausted(#[from] ResourceExhaustion),
    /// Persisted state could not be decoded.
    #[error(transparent)]
    Corruption(#[from] StreamCorruption),
    /// The world state failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Stored code no longer validates.
    #[error(transparent)]
    Rejected(#[from] StaticRejection),
    /// Code is already deployed at the address.
    #[error("contract already deployed at {address}")]
    AddressOccupied {
        /// The address.
        address: Address,
    },
    /// No code is deployed at the address.
    #[error("no contract at {address}")]
    NoCode {
        /// The address.
        address: Address,
    },
    /// The main class has no such public static method.
    #[error("no entry point {name}{descriptor}")]
    NoEntryPoint {
        /// Method name.
        name: String,
        /// Method descriptor.
        descriptor: String,
    },
    /// The supplied arguments do not match the entry point's descriptor.
    #[error("arguments do not match descriptor {descriptor}")]
    ArgumentMismatch {
        /// Method descriptor.
        descriptor: String,
    },
    /// A call reached a method without code.
    #[error("abstract method {name}{descriptor} invoked")]
    AbstractMethod {
        /// Method name.
        name: String,
        /// Method descriptor.
        descriptor: String,
    },
    /// An instruction found operands validation should have excluded.
    #[error("inconsistent operand state at instruction {at}")]
    OperandMismatch {
        /// Instruction index.
        at: usize,
    },
}

impl From<PersistenceError> for InvocationFailure {
    fn from(error: PersistenceError) -> Self {
        match error {
            PersistenceError::Corruption(e) => Self::Corruption(e),
            PersistenceError::Storage(e) => Self::Storage(e),
            PersistenceError::Exhausted(e) => Self::Exhausted(e),
        }
    }
}

impl InvocationFailure {
    /// Whether the failure ends the whole invocation rather than only the failing call.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted(_) | Self::Corruption(_) | Self::Storage(_))
    }

    /// The status the failure is reported with.
    pub const fn status(&self) -> InvocationStatus {
        match self {
            Self::Uncaught { .. } |
            Self::Reverted |
            Self::FrameDepthExceeded { .. } |
            Self::CallDepthExceeded { .. } |
            Self::ForeignReference { .. } => InvocationStatus::Revert,
            Self::Exhausted(_) => InvocationStatus::OutOfResources,
            Self::Corruption(_) |
            Self::Storage(_) |
            Self::Rejected(_) |
            Self::AddressOccupied { .. } |
            Self::NoCode { .. } |
            Self::NoEntryPoint { .. } |
            Self::ArgumentMismatch { .. } |
            Self::AbstractMethod { .. } |
            Self::OperandMismatch { .. } => InvocationStatus::RejectedAtRuntime,
        }
    }
}

/// The result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    /// How the invocation ended.
    pub status: InvocationStatus,
    /// Energy consumed, net of reclamation credits. The whole budget when out of resources.
    pub energy_used: i64,
    /// Consumption by category.
    pub usage: EnergyUsage,
    /// The entry point's return value on success.
    pub return_value: Option<Value>,
    /// The contract's root record after the invocation.
    pub root_state: Bytes,
    /// Failure detail when not successful.
    pub failure: Option<InvocationFailure>,
}

impl InvocationOutcome {
    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }
}
