//! Runtime-owned classes every code unit links against.
//!
//! They occupy the first class ids of every unit, in table order, so persisted records referring
//! to them stay stable across deployments.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// The universal base type.
pub const OBJECT: &str = "avm/Object";
/// The base of every throwable type.
pub const THROWABLE: &str = "avm/Throwable";
/// Thrown in the caller when a cross-contract call fails.
pub const CALL_FAILED_EXCEPTION: &str = "avm/CallFailedException";
/// Holder of the host natives.
pub const BLOCKCHAIN: &str = "avm/Blockchain";

/// The namespace reserved for runtime-owned classes.
pub const RESERVED_PREFIX: &str = "avm/";

/// A runtime-owned class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinType {
    /// Class name.
    pub name: &'static str,
    /// Superclass name; only the universal base has none.
    pub super_name: Option<&'static str>,
    /// Declared instance fields as `(name, descriptor)`.
    pub fields: &'static [(&'static str, &'static str)],
}

/// Every built-in class, parents before children.
pub const BUILTIN_TYPES: &[BuiltinType] = &[
    BuiltinType { name: OBJECT, super_name: None, fields: &[] },
    BuiltinType {
        name: THROWABLE,
        super_name: Some(OBJECT),
        fields: &[("code", "I"), ("cause", "Lavm/Throwable;")],
    },
    BuiltinType { name: "avm/Exception", super_name: Some(THROWABLE), fields: &[] },
    BuiltinType {
        name: "avm/RuntimeException",
        super_name: Some("avm/Exception"),
        fields: &[],
    },
    BuiltinType {
        name: "avm/ArithmeticException",
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType {
        name: "avm/ArrayIndexOutOfBoundsException",
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType {
        name: "avm/NegativeArraySizeException",
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType {
        name: "avm/NullPointerException",
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType {
        name: "avm/ClassCastException",
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType {
        name: CALL_FAILED_EXCEPTION,
        super_name: Some("avm/RuntimeException"),
        fields: &[],
    },
    BuiltinType { name: BLOCKCHAIN, super_name: Some(OBJECT), fields: &[] },
];

static BUILTIN_INDEX: Lazy<HashMap<&'static str, usize>> =
    Lazy::new(|| BUILTIN_TYPES.iter().enumerate().map(|(i, ty)| (ty.name, i)).collect());

/// Looks up a built-in class by name, returning its position in [`BUILTIN_TYPES`].
pub fn builtin_index(name: &str) -> Option<usize> {
    BUILTIN_INDEX.get(name).copied()
}

/// Whether `name` is a built-in class.
pub fn is_builtin(name: &str) -> bool {
    builtin_index(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_precede_children() {
        for (i, ty) in BUILTIN_TYPES.iter().enumerate() {
            if let Some(parent) = ty.super_name {
                assert!(builtin_index(parent).unwrap() < i, "{} before its parent", ty.name);
            }
            assert!(ty.name.starts_with(RESERVED_PREFIX));
        }
        assert_eq!(builtin_index(OBJECT), Some(0));
        assert!(!is_builtin("Main"));
    }
}
