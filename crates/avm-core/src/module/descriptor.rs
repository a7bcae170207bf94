//! Field and method type descriptors.

use core::fmt;

/// Error returned for a descriptor string that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed descriptor: {descriptor:?}")]
pub struct DescriptorError {
    /// The offending descriptor.
    pub descriptor: String,
}

/// The operand-stack category of a value.
///
/// Sub-int primitives (`boolean`, `byte`, `char`, `short`) are widened to [`ValueKind::Int`] on
/// the stack and in locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Object or container reference, possibly null.
    Reference,
}

impl ValueKind {
    /// Number of stack or local slots a value of this kind occupies.
    pub const fn slots(self) -> u16 {
        match self {
            Self::Long | Self::Double => 2,
            Self::Int | Self::Float | Self::Reference => 1,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Reference => "reference",
        })
    }
}

/// The declared type of a field, parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `S`
    Short,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// `L...;` or any array type.
    Reference,
}

impl FieldKind {
    /// Parses a complete field descriptor such as `J` or `[Lfoo/Bar;`.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let bytes = descriptor.as_bytes();
        let mut pos = 0;
        let kind = Self::parse_at(bytes, &mut pos).ok_or_else(|| malformed(descriptor))?;
        if pos != bytes.len() {
            return Err(malformed(descriptor));
        }
        Ok(kind)
    }

    fn parse_at(bytes: &[u8], pos: &mut usize) -> Option<Self> {
        let tag = *bytes.get(*pos)?;
        *pos += 1;
        Some(match tag {
            b'Z' => Self::Boolean,
            b'B' => Self::Byte,
            b'C' => Self::Char,
            b'S' => Self::Short,
            b'I' => Self::Int,
            b'J' => Self::Long,
            b'F' => Self::Float,
            b'D' => Self::Double,
            b'L' => {
                let len = bytes[*pos..].iter().position(|&b| b == b';')?;
                if len == 0 {
                    return None;
                }
                *pos += len + 1;
                Self::Reference
            }
            b'[' => {
                Self::parse_at(bytes, pos)?;
                Self::Reference
            }
            _ => return None,
        })
    }

    /// The stack category values of this kind take.
    pub const fn value_kind(self) -> ValueKind {
        match self {
            Self::Boolean | Self::Byte | Self::Char | Self::Short | Self::Int => ValueKind::Int,
            Self::Long => ValueKind::Long,
            Self::Float => ValueKind::Float,
            Self::Double => ValueKind::Double,
            Self::Reference => ValueKind::Reference,
        }
    }

    /// Number of slots a value of this kind occupies.
    pub const fn slots(self) -> u16 {
        self.value_kind().slots()
    }
}

/// A parsed method descriptor such as `(IJ)V`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Parameter kinds, in declaration order.
    pub params: Vec<FieldKind>,
    /// Return kind, `None` for `void`.
    pub ret: Option<FieldKind>,
}

impl MethodDescriptor {
    /// Parses a method descriptor.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(malformed(descriptor));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        loop {
            match bytes.get(pos) {
                Some(b')') => {
                    pos += 1;
                    break;
                }
                Some(_) => params.push(
                    FieldKind::parse_at(bytes, &mut pos).ok_or_else(|| malformed(descriptor))?,
                ),
                None => return Err(malformed(descriptor)),
            }
        }
        let ret = if bytes.get(pos) == Some(&b'V') {
            pos += 1;
            None
        } else {
            Some(FieldKind::parse_at(bytes, &mut pos).ok_or_else(|| malformed(descriptor))?)
        };
        if pos != bytes.len() {
            return Err(malformed(descriptor));
        }
        Ok(Self { params, ret })
    }

    /// Total slots taken by the parameters, excluding any receiver.
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(|kind| kind.slots()).sum()
    }
}

fn malformed(descriptor: &str) -> DescriptorError {
    DescriptorError { descriptor: descriptor.to_owned() }
}
