//! # Object graph persistence
//!
//! Each contract's heap outlives the invocation that built it. Between invocations the graph
//! lives in account storage as one record per object plus a root record holding the statics
//! and the ids of every persisted object.
//!
//! ## Records
//!
//! An instance record is split in two regions. The automatic region holds the universal base
//! identity and the field groups of every ancestor above the type's boundary; the runtime
//! encodes it in declaration order. The manual region holds the groups from the boundary down,
//! each encoded by the [`ManualFieldCodec`] its declaring type registered. See [`layout`].
//!
//! ## Lazy loading
//!
//! Opening a heap reads only the root record. References found in any decoded record become
//! stubs, and a stub's record is read (and billed) the first time the object is touched.
//!
//! ## Commit and reclamation
//!
//! At the end of a successful activation the heap walks everything reachable from the statics,
//! writes what is new or changed, and reclaims previously persisted objects that are no longer
//! reachable, crediting the ledger once per reclaimed object.

pub mod layout;
pub use layout::*;

mod heap;
mod record;
mod root;
pub use heap::*;
pub use record::*;
pub use root::*;

use crate::{ResourceExhaustion, StorageError, StreamCorruption};

/// A persistence operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    /// A record could not be decoded.
    #[error(transparent)]
    Corruption(#[from] StreamCorruption),
    /// The world state failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The ledger refused a read or write charge.
    #[error(transparent)]
    Exhausted(#[from] ResourceExhaustion),
}
