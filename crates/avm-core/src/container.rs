//! Capability-checked containers standing in for native fixed-size arrays.
//!
//! One generic [`Container`] holds the elements of any kind; [`TypedContainer`] tags it with the
//! element kind so it can live on the heap and be persisted. Every access is bounds-checked and
//! the length never changes after construction.

use core::fmt;

use crate::{
    bytecode::opcode,
    codec::{CodecError, Decoder, Encoder},
    CapabilityViolation, InstanceId, StreamCorruption, Value, ValueKind,
};

/// The element kind of a container.
///
/// `boolean` arrays share the byte representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    /// Signed 8-bit elements (also `boolean`).
    Byte,
    /// 16-bit character elements.
    Char,
    /// Signed 16-bit elements.
    Short,
    /// Signed 32-bit elements.
    Int,
    /// Signed 64-bit elements.
    Long,
    /// Single precision elements.
    Float,
    /// Double precision elements.
    Double,
    /// Reference elements.
    Object,
}

impl ElementKind {
    /// Every element kind, in tag order.
    pub const ALL: [Self; 8] = [
        Self::Byte,
        Self::Char,
        Self::Short,
        Self::Int,
        Self::Long,
        Self::Float,
        Self::Double,
        Self::Object,
    ];

    /// Maps a `newarray` type code to its element kind.
    pub const fn from_array_type(atype: u8) -> Option<Self> {
        Some(match atype {
            opcode::T_BOOLEAN | opcode::T_BYTE => Self::Byte,
            opcode::T_CHAR => Self::Char,
            opcode::T_SHORT => Self::Short,
            opcode::T_INT => Self::Int,
            opcode::T_LONG => Self::Long,
            opcode::T_FLOAT => Self::Float,
            opcode::T_DOUBLE => Self::Double,
            _ => return None,
        })
    }

    /// Maps an array class name such as `[I` or `[Lfoo;` to its element kind.
    pub fn from_class_name(name: &str) -> Option<Self> {
        let component = name.strip_prefix('[')?;
        Some(match component {
            "Z" | "B" => Self::Byte,
            "C" => Self::Char,
            "S" => Self::Short,
            "I" => Self::Int,
            "J" => Self::Long,
            "F" => Self::Float,
            "D" => Self::Double,
            _ if component.starts_with('[') || component.starts_with('L') => Self::Object,
            _ => return None,
        })
    }

    /// The persisted tag of the kind.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parses a persisted tag.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        if (tag as usize) < Self::ALL.len() {
            Some(Self::ALL[tag as usize])
        } else {
            None
        }
    }

    /// The stack category of the elements.
    pub const fn value_kind(self) -> ValueKind {
        match self {
            Self::Byte | Self::Char | Self::Short | Self::Int => ValueKind::Int,
            Self::Long => ValueKind::Long,
            Self::Float => ValueKind::Float,
            Self::Double => ValueKind::Double,
            Self::Object => ValueKind::Reference,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Object => "object",
        })
    }
}

/// An element type storable in a [`Container`].
pub trait Element: Copy + Default + PartialEq + fmt::Debug + 'static {
    /// The kind tag of this element type.
    const KIND: ElementKind;

    /// Writes one element.
    fn encode(self, enc: &mut Encoder);

    /// Reads one element.
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError>;

    /// Converts a stack value, narrowing `int`s to the element width. Returns `None` for a
    /// value of the wrong category.
    fn from_value(value: Value) -> Option<Self>;

    /// Widens the element to a stack value.
    fn into_value(self) -> Value;
}

macro_rules! int_element {
    ($ty:ty, $kind:ident, $encode:ident, $decode:ident) => {
        impl Element for $ty {
            const KIND: ElementKind = ElementKind::$kind;

            fn encode(self, enc: &mut Encoder) {
                enc.$encode(self);
            }

            fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
                dec.$decode()
            }

            fn from_value(value: Value) -> Option<Self> {
                value.as_int().map(|v| v as $ty)
            }

            fn into_value(self) -> Value {
                Value::Int(self as i32)
            }
        }
    };
}

int_element!(i8, Byte, encode_byte, decode_byte);
int_element!(u16, Char, encode_char, decode_char);
int_element!(i16, Short, encode_short, decode_short);
int_element!(i32, Int, encode_int, decode_int);

impl Element for i64 {
    const KIND: ElementKind = ElementKind::Long;

    fn encode(self, enc: &mut Encoder) {
        enc.encode_long(self);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        dec.decode_long()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_long()
    }

    fn into_value(self) -> Value {
        Value::Long(self)
    }
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::Float;

    fn encode(self, enc: &mut Encoder) {
        enc.encode_float(self);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        dec.decode_float()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_float()
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::Double;

    fn encode(self, enc: &mut Encoder) {
        enc.encode_double(self);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        dec.decode_double()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_double()
    }

    fn into_value(self) -> Value {
        Value::Double(self)
    }
}

impl Element for Option<InstanceId> {
    const KIND: ElementKind = ElementKind::Object;

    fn encode(self, enc: &mut Encoder) {
        enc.encode_u64(self.map_or(0, |id| id.0));
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Some(dec.decode_u64()?).filter(|&id| id != 0).map(InstanceId))
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_reference()
    }

    fn into_value(self) -> Value {
        Value::Ref(self)
    }
}

/// A fixed-length, bounds-checked sequence of elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Container<T: Element> {
    elements: Box<[T]>,
}

impl<T: Element> Container<T> {
    /// Allocates a container of `length` zero elements.
    pub fn new(length: i32) -> Result<Self, CapabilityViolation> {
        let len = usize::try_from(length)
            .map_err(|_| CapabilityViolation::NegativeLength { length })?;
        Ok(Self { elements: vec![T::default(); len].into_boxed_slice() })
    }

    /// Wraps existing elements.
    pub fn from_elements(elements: Vec<T>) -> Self {
        Self { elements: elements.into_boxed_slice() }
    }

    /// The number of elements.
    pub fn length(&self) -> i32 {
        self.elements.len() as i32
    }

    /// The elements.
    pub fn as_slice(&self) -> &[T] {
        &self.elements
    }

    fn check(&self, index: i32) -> Result<usize, CapabilityViolation> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.elements.len())
            .ok_or(CapabilityViolation::IndexOutOfBounds { index, length: self.length() })
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: i32) -> Result<T, CapabilityViolation> {
        Ok(self.elements[self.check(index)?])
    }

    /// Writes the element at `index`.
    pub fn set(&mut self, index: i32, value: T) -> Result<(), CapabilityViolation> {
        let i = self.check(index)?;
        self.elements[i] = value;
        Ok(())
    }

    /// Writes the length followed by every element.
    pub fn serialize(&self, enc: &mut Encoder) {
        enc.encode_int(self.length());
        for element in self.elements.iter() {
            element.encode(enc);
        }
    }

    /// Reads a container written by [`Container::serialize`].
    pub fn deserialize(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let len = dec.decode_length()?;
        // Each element takes at least one byte, so the stream bounds the allocation.
        if len > dec.remaining() {
            return Err(CodecError::StreamExhausted { needed: len, remaining: dec.remaining() });
        }
        let mut elements = Vec::with_capacity(len);
        for _ in 0..len {
            elements.push(T::decode(dec)?);
        }
        Ok(Self::from_elements(elements))
    }
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            TypedContainer::Byte($c) => $body,
            TypedContainer::Char($c) => $body,
            TypedContainer::Short($c) => $body,
            TypedContainer::Int($c) => $body,
            TypedContainer::Long($c) => $body,
            TypedContainer::Float($c) => $body,
            TypedContainer::Double($c) => $body,
            TypedContainer::Object($c) => $body,
        }
    };
}

/// A container tagged with its element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedContainer {
    /// Byte and boolean elements.
    Byte(Container<i8>),
    /// Character elements.
    Char(Container<u16>),
    /// Short elements.
    Short(Container<i16>),
    /// Int elements.
    Int(Container<i32>),
    /// Long elements.
    Long(Container<i64>),
    /// Float elements.
    Float(Container<f32>),
    /// Double elements.
    Double(Container<f64>),
    /// Reference elements.
    Object(Container<Option<InstanceId>>),
}

impl TypedContainer {
    /// Allocates a zeroed container of the given kind.
    pub fn new(kind: ElementKind, length: i32) -> Result<Self, CapabilityViolation> {
        Ok(match kind {
            ElementKind::Byte => Self::Byte(Container::new(length)?),
            ElementKind::Char => Self::Char(Container::new(length)?),
            ElementKind::Short => Self::Short(Container::new(length)?),
            ElementKind::Int => Self::Int(Container::new(length)?),
            ElementKind::Long => Self::Long(Container::new(length)?),
            ElementKind::Float => Self::Float(Container::new(length)?),
            ElementKind::Double => Self::Double(Container::new(length)?),
            ElementKind::Object => Self::Object(Container::new(length)?),
        })
    }

    /// The element kind.
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Byte(_) => ElementKind::Byte,
            Self::Char(_) => ElementKind::Char,
            Self::Short(_) => ElementKind::Short,
            Self::Int(_) => ElementKind::Int,
            Self::Long(_) => ElementKind::Long,
            Self::Float(_) => ElementKind::Float,
            Self::Double(_) => ElementKind::Double,
            Self::Object(_) => ElementKind::Object,
        }
    }

    /// The number of elements.
    pub fn length(&self) -> i32 {
        dispatch!(self, c => c.length())
    }

    /// Reads the element at `index` as a stack value.
    pub fn get(&self, index: i32) -> Result<Value, CapabilityViolation> {
        dispatch!(self, c => c.get(index).map(Element::into_value))
    }

    /// Writes a stack value at `index`.
    pub fn set(&mut self, index: i32, value: Value) -> Result<(), CapabilityViolation> {
        let kind = self.kind();
        dispatch!(self, c => {
            let element = Element::from_value(value)
                .ok_or(CapabilityViolation::IncompatibleElement { kind })?;
            c.set(index, element)
        })
    }

    /// Non-null references held by an object container.
    pub fn references(&self) -> impl Iterator<Item = InstanceId> + '_ {
        let elements = match self {
            Self::Object(c) => c.as_slice(),
            _ => &[],
        };
        elements.iter().filter_map(|element| *element)
    }

    /// Writes the kind tag, the length and every element.
    pub fn serialize(&self, enc: &mut Encoder) {
        enc.encode_u8(self.kind().tag());
        self.serialize_elements(enc);
    }

    /// Writes the length and every element, without the kind tag.
    pub fn serialize_elements(&self, enc: &mut Encoder) {
        dispatch!(self, c => c.serialize(enc))
    }

    /// Reads a container written by [`TypedContainer::serialize`].
    pub fn deserialize(dec: &mut Decoder<'_>) -> Result<Self, StreamCorruption> {
        let kind = Self::decode_kind(dec)?;
        Self::deserialize_elements(kind, dec)
    }

    /// Reads an element kind tag.
    pub fn decode_kind(dec: &mut Decoder<'_>) -> Result<ElementKind, StreamCorruption> {
        let tag = dec.decode_u8()?;
        ElementKind::from_tag(tag).ok_or(StreamCorruption::UnknownElementKind { tag })
    }

    /// Reads a container of a known kind written by [`TypedContainer::serialize_elements`].
    pub fn deserialize_elements(
        kind: ElementKind,
        dec: &mut Decoder<'_>,
    ) -> Result<Self, StreamCorruption> {
        Ok(match kind {
            ElementKind::Byte => Self::Byte(Container::deserialize(dec)?),
            ElementKind::Char => Self::Char(Container::deserialize(dec)?),
            ElementKind::Short => Self::Short(Container::deserialize(dec)?),
            ElementKind::Int => Self::Int(Container::deserialize(dec)?),
            ElementKind::Long => Self::Long(Container::deserialize(dec)?),
            ElementKind::Float => Self::Float(Container::deserialize(dec)?),
            ElementKind::Double => Self::Double(Container::deserialize(dec)?),
            ElementKind::Object => Self::Object(Container::deserialize(dec)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_fixed() {
        let mut container = TypedContainer::new(ElementKind::Long, 3).unwrap();
        assert_eq!(container.length(), 3);
        container.set(2, Value::Long(7)).unwrap();
        assert_eq!(container.length(), 3);
        assert_eq!(container.get(2).unwrap(), Value::Long(7));
        assert_eq!(container.get(0).unwrap(), Value::Long(0));
    }

    #[test]
    fn test_bounds_hold_for_every_kind() {
        for kind in ElementKind::ALL {
            let mut container = TypedContainer::new(kind, 2).unwrap();
            let zero = container.get(1).unwrap();
            for index in [-1, 2, i32::MIN, i32::MAX] {
                let violation = CapabilityViolation::IndexOutOfBounds { index, length: 2 };
                assert_eq!(container.get(index), Err(violation.clone()), "{kind:?}");
                assert_eq!(container.set(index, zero), Err(violation), "{kind:?}");
            }
            container.set(0, zero).unwrap();
        }
    }

    #[test]
    fn test_negative_length_is_refused() {
        assert_eq!(
            TypedContainer::new(ElementKind::Int, -1),
            Err(CapabilityViolation::NegativeLength { length: -1 })
        );
        assert_eq!(TypedContainer::new(ElementKind::Int, 0).unwrap().length(), 0);
    }

    #[test]
    fn test_byte_store_truncates() {
        let mut container = TypedContainer::new(ElementKind::Byte, 1).unwrap();
        container.set(0, Value::Int(0x1ff)).unwrap();
        assert_eq!(container.get(0).unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_wrong_value_kind_is_refused() {
        let mut container = TypedContainer::new(ElementKind::Double, 1).unwrap();
        assert_eq!(
            container.set(0, Value::Int(1)),
            Err(CapabilityViolation::IncompatibleElement { kind: ElementKind::Double })
        );
    }

    #[test]
    fn test_object_references() {
        let mut container = TypedContainer::new(ElementKind::Object, 3).unwrap();
        container.set(0, Value::Ref(Some(InstanceId(4)))).unwrap();
        container.set(2, Value::Ref(Some(InstanceId(9)))).unwrap();
        assert_eq!(container.references().collect::<Vec<_>>(), vec![InstanceId(4), InstanceId(9)]);
    }

    #[test]
    fn test_serialized_layout() {
        let mut container = TypedContainer::new(ElementKind::Short, 2).unwrap();
        container.set(1, Value::Int(-2)).unwrap();
        let mut enc = Encoder::new();
        container.serialize(&mut enc);
        let bytes = enc.finish();
        assert_eq!(&bytes[..], &[ElementKind::Short.tag(), 0, 0, 0, 2, 0, 0, 0xff, 0xfe]);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(TypedContainer::deserialize(&mut dec).unwrap(), container);
    }

    #[test]
    fn test_hostile_length_is_exhausted_not_allocated() {
        let bytes = [ElementKind::Long.tag(), 0x7f, 0xff, 0xff, 0xff];
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(
            TypedContainer::deserialize(&mut dec),
            Err(StreamCorruption::Codec(CodecError::StreamExhausted { .. }))
        ));
    }

    #[test]
    fn test_array_class_names() {
        assert_eq!(ElementKind::from_class_name("[Z"), Some(ElementKind::Byte));
        assert_eq!(ElementKind::from_class_name("[J"), Some(ElementKind::Long));
        assert_eq!(ElementKind::from_class_name("[[I"), Some(ElementKind::Object));
        assert_eq!(ElementKind::from_class_name("[Lavm/Object;"), Some(ElementKind::Object));
        assert_eq!(ElementKind::from_class_name("avm/Object"), None);
    }
}
