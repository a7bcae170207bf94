//! Error classes shared across the sandbox.

use crate::{codec::CodecError, ClassId, ElementKind, InstanceId};

/// A capability check failed inside sandboxed code.
///
/// These never abort the host: the interpreter materializes each one as an instance of the
/// matching built-in exception class and unwinds through the contract's own handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityViolation {
    /// A container index was negative or not below the length.
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds {
        /// The requested index.
        index: i32,
        /// The container length.
        length: i32,
    },
    /// A container was requested with a negative length.
    #[error("negative container length: {length}")]
    NegativeLength {
        /// The requested length.
        length: i32,
    },
    /// A null reference was dereferenced.
    #[error("null reference")]
    NullReference,
    /// An integer division or remainder by zero.
    #[error("division by zero")]
    DivideByZero,
    /// A reference was used as a type it does not have.
    #[error("class cast: {found} is not a {expected}")]
    ClassCast {
        /// The required type.
        expected: String,
        /// The actual type.
        found: String,
    },
    /// A value of the wrong kind was stored into a container.
    #[error("incompatible element for {kind} container")]
    IncompatibleElement {
        /// The container's element kind.
        kind: ElementKind,
    },
}

impl CapabilityViolation {
    /// The built-in exception class the violation is thrown as.
    pub const fn exception_class(&self) -> &'static str {
        match self {
            Self::IndexOutOfBounds { .. } => "avm/ArrayIndexOutOfBoundsException",
            Self::NegativeLength { .. } => "avm/NegativeArraySizeException",
            Self::NullReference => "avm/NullPointerException",
            Self::DivideByZero => "avm/ArithmeticException",
            Self::ClassCast { .. } | Self::IncompatibleElement { .. } => "avm/ClassCastException",
        }
    }
}

/// Persisted state could not be decoded.
///
/// This is an internal consistency failure: either storage was corrupted or it was written by
/// an incompatible code unit. It is never silently recovered from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamCorruption {
    /// The byte stream itself was malformed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A record starts with an unknown tag.
    #[error("unknown record tag: {tag}")]
    UnknownRecordTag {
        /// The tag byte.
        tag: u8,
    },
    /// A container record names an unknown element kind.
    #[error("unknown element kind tag: {tag}")]
    UnknownElementKind {
        /// The tag byte.
        tag: u8,
    },
    /// An instance record names a class the code unit does not have.
    #[error("unknown class index: {index}")]
    UnknownClass {
        /// The class index.
        index: u16,
    },
    /// A live instance has no record.
    #[error("missing record for instance {id}")]
    MissingRecord {
        /// The instance.
        id: InstanceId,
    },
    /// The contract has code but no root record.
    #[error("missing root record")]
    MissingRoot,
    /// A serialization boundary is not an ancestor of the serialized class.
    #[error("boundary class {boundary} is not in the hierarchy of class {class}")]
    BoundaryNotInHierarchy {
        /// The serialized class.
        class: ClassId,
        /// The requested boundary.
        boundary: ClassId,
    },
}

/// The invocation ran out of energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("energy limit exceeded: required={required} > limit={limit}")]
pub struct ResourceExhaustion {
    /// The invocation's energy limit.
    pub limit: u64,
    /// Energy the rejected charge would have brought consumption to.
    pub required: u64,
}

/// A world-state backend failure, with the backend's error erased to its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("world state error: {0}")]
pub struct StorageError(pub String);
