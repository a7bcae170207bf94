use serde::{Deserialize, Serialize};

use crate::{
    codec::{CodecError, Decoder, Encoder},
    FieldKind, ValueKind,
};

/// The stable identity of a heap object within one contract's persisted graph.
///
/// Ids are allocated monotonically per contract and never reused, so reachability and
/// reclamation are keyed on them rather than on in-process references.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[display("#{_0}")]
pub struct InstanceId(pub u64);

/// A value on the operand stack, in a local slot, in a field or in a container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// `boolean`, `byte`, `char`, `short` and `int` values.
    Int(i32),
    /// `long` values.
    Long(i64),
    /// `float` values.
    Float(f32),
    /// `double` values.
    Double(f64),
    /// A possibly-null reference.
    Ref(Option<InstanceId>),
}

impl Value {
    /// The null reference.
    pub const NULL: Self = Self::Ref(None);

    /// The stack category of the value.
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Ref(_) => ValueKind::Reference,
        }
    }

    /// Stack slots taken by the value.
    pub const fn slots(&self) -> u16 {
        self.kind().slots()
    }

    /// The zero value of a field kind.
    pub const fn default_of(kind: FieldKind) -> Self {
        match kind.value_kind() {
            ValueKind::Int => Self::Int(0),
            ValueKind::Long => Self::Long(0),
            ValueKind::Float => Self::Float(0.0),
            ValueKind::Double => Self::Double(0.0),
            ValueKind::Reference => Self::NULL,
        }
    }

    /// The `int` payload, if this is an `int`.
    pub const fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The `long` payload, if this is a `long`.
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// The `float` payload, if this is a `float`.
    pub const fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// The `double` payload, if this is a `double`.
    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The reference payload, if this is a reference.
    pub const fn as_reference(&self) -> Option<Option<InstanceId>> {
        match self {
            Self::Ref(v) => Some(*v),
            _ => None,
        }
    }

    /// The referenced instance, if this is a non-null reference.
    pub const fn referent(&self) -> Option<InstanceId> {
        match self {
            Self::Ref(Some(id)) => Some(*id),
            _ => None,
        }
    }

    /// Narrows an `int` to the width of a sub-int field kind; other values are unchanged.
    pub const fn narrow(self, kind: FieldKind) -> Self {
        match (kind, self) {
            (FieldKind::Boolean, Self::Int(v)) => Self::Int(v & 1),
            (FieldKind::Byte, Self::Int(v)) => Self::Int(v as i8 as i32),
            (FieldKind::Char, Self::Int(v)) => Self::Int(v as u16 as i32),
            (FieldKind::Short, Self::Int(v)) => Self::Int(v as i16 as i32),
            _ => self,
        }
    }

    /// Encodes the value in the fixed-width layout of `kind`. References are written as a
    /// `long`, `0` standing for null.
    ///
    /// A value whose category does not match `kind` is written as the kind's zero value; field
    /// stores are kind-checked before they reach the encoder.
    pub fn encode_as(&self, kind: FieldKind, enc: &mut Encoder) {
        let value = if self.kind() == kind.value_kind() {
            self.narrow(kind)
        } else {
            Self::default_of(kind)
        };
        match (kind, value) {
            (FieldKind::Boolean, Self::Int(v)) => {
                enc.encode_bool(v != 0);
            }
            (FieldKind::Byte, Self::Int(v)) => {
                enc.encode_byte(v as i8);
            }
            (FieldKind::Char, Self::Int(v)) => {
                enc.encode_char(v as u16);
            }
            (FieldKind::Short, Self::Int(v)) => {
                enc.encode_short(v as i16);
            }
            (_, Self::Int(v)) => {
                enc.encode_int(v);
            }
            (_, Self::Long(v)) => {
                enc.encode_long(v);
            }
            (_, Self::Float(v)) => {
                enc.encode_float(v);
            }
            (_, Self::Double(v)) => {
                enc.encode_double(v);
            }
            (_, Self::Ref(id)) => {
                enc.encode_u64(id.map_or(0, |id| id.0));
            }
        }
    }

    /// Decodes a value written by [`Value::encode_as`] with the same `kind`.
    pub fn decode_as(kind: FieldKind, dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(match kind {
            FieldKind::Boolean => Self::Int(dec.decode_bool()? as i32),
            FieldKind::Byte => Self::Int(dec.decode_byte()? as i32),
            FieldKind::Char => Self::Int(dec.decode_char()? as i32),
            FieldKind::Short => Self::Int(dec.decode_short()? as i32),
            FieldKind::Int => Self::Int(dec.decode_int()?),
            FieldKind::Long => Self::Long(dec.decode_long()?),
            FieldKind::Float => Self::Float(dec.decode_float()?),
            FieldKind::Double => Self::Double(dec.decode_double()?),
            FieldKind::Reference => {
                Self::Ref(Some(dec.decode_u64()?).filter(|&id| id != 0).map(InstanceId))
            }
        })
    }
}
