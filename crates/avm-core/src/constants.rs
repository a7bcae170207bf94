//! Constants for the contract sandbox.
//!
//! It groups the constants by concern as sub-modules: structural limits enforced at deployment,
//! the energy price list charged at run time, and the storage key layout of persisted state.

/// Structural ceilings enforced by the static complexity validator and the interpreter.
///
/// A value exactly at a ceiling is legal; one unit past it is rejected.
pub mod limits {
    /// The maximum length, in bytes, of a single method's code attribute.
    pub const MAX_METHOD_BYTE_LENGTH: usize = 65_535;
    /// The maximum number of entries in a single method's exception table.
    pub const MAX_EXCEPTION_TABLE_ENTRIES: usize = 64;
    /// The maximum operand stack depth of a method, in slots. `long` and `double` values occupy
    /// two slots.
    pub const MAX_OPERAND_STACK_DEPTH: u16 = 512;
    /// The maximum number of local variable slots of a method, including `this` and the
    /// parameters. `long` and `double` values occupy two slots.
    pub const MAX_LOCAL_SLOTS: u16 = 256;
    /// The maximum number of classes in a single contract module.
    pub const MAX_CLASSES: usize = 1024;
    /// The maximum number of interpreter frames live at once within one contract activation.
    pub const MAX_FRAME_DEPTH: usize = 512;
    /// The maximum nesting of cross-contract calls, counting the outermost invocation.
    pub const MAX_CALL_DEPTH: usize = 10;
}

/// The energy price list.
///
/// Storage costs follow a fixed-plus-per-byte model: every record read costs
/// [`FIXED_READ_COST`](energy::FIXED_READ_COST) plus [`BYTE_READ_COST`](energy::BYTE_READ_COST)
/// per byte, and every record write costs a per-object base (new objects are priced higher than
/// updates) plus [`BYTE_WRITE_COST`](energy::BYTE_WRITE_COST) per byte.
pub mod energy {
    /// Energy charged for every executed instruction.
    pub const INSTRUCTION_COST: u64 = 1;
    /// Energy charged for every container `get`, `set` or `length` call.
    pub const CONTAINER_ACCESS_COST: u64 = 2;
    /// Base energy charged for allocating an object or a container.
    pub const ALLOCATION_BASE_COST: u64 = 10;
    /// Energy charged per field or element of a freshly allocated object or container.
    pub const ALLOCATION_PER_ELEMENT_COST: u64 = 1;
    /// Energy charged for every method invocation, on top of the instruction itself.
    pub const INVOKE_COST: u64 = 5;
    /// Energy charged for every call into a host native.
    pub const NATIVE_COST: u64 = 20;
    /// Fixed energy charged for reading one persisted record.
    pub const FIXED_READ_COST: u64 = 5_000;
    /// Energy charged per byte of a persisted record read.
    pub const BYTE_READ_COST: u64 = 1;
    /// Fixed energy charged for writing a record that did not exist before.
    pub const PER_OBJECT_WRITE_NEW: u64 = 20_000;
    /// Fixed energy charged for overwriting an existing record with different bytes.
    pub const PER_OBJECT_WRITE_UPDATE: u64 = 5_000;
    /// Energy charged per byte of a persisted record write.
    pub const BYTE_WRITE_COST: u64 = 1;
    /// Flat energy credited for every reclaimed instance. It is the inverse of the fixed part of
    /// the original write charge.
    pub const RECLAIM_CREDIT: u64 = PER_OBJECT_WRITE_NEW;
    /// Energy charged per byte of contract code stored at deployment.
    pub const CODE_DEPOSIT_BYTE_COST: u64 = 200;
}

/// Storage key layout of a contract's persisted object graph.
pub mod storage {
    /// The key of the root record holding the statics and the live instance table.
    pub const ROOT_RECORD_KEY: &[u8] = &[0x00];
    /// The prefix of an instance record key. The key is the prefix followed by the big-endian
    /// instance id.
    pub const INSTANCE_KEY_PREFIX: u8 = 0x01;
}

/// Constants of the contract module format.
pub mod format {
    /// The magic number every contract module starts with (`AVM1`).
    pub const MODULE_MAGIC: u32 = 0x4156_4d31;
    /// The only supported module format version.
    pub const MODULE_VERSION: u16 = 1;
    /// The record tag of a persisted class instance.
    pub const INSTANCE_RECORD_TAG: u8 = 1;
    /// The record tag of a persisted container.
    pub const CONTAINER_RECORD_TAG: u8 = 2;
}
