use crate::{
    codec::{Decoder, Encoder},
    constants::format::{CONTAINER_RECORD_TAG, INSTANCE_RECORD_TAG},
    ClassId, InstanceId, SplitBoundary, StreamCorruption, TypeRegistry, TypedContainer, Value,
};

/// The contents of a heap object.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    /// A class instance with its fields, base first.
    Instance {
        /// The instance's type.
        class: ClassId,
        /// Field values.
        fields: Vec<Value>,
    },
    /// A container.
    Container(TypedContainer),
}

/// An object on a contract's heap.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// The universal base identity, fixed at allocation.
    pub identity_hash: i32,
    /// The object's contents.
    pub body: ObjectBody,
}

impl HeapObject {
    /// A fresh instance with zeroed fields.
    pub const fn instance(identity_hash: i32, class: ClassId, fields: Vec<Value>) -> Self {
        Self { identity_hash, body: ObjectBody::Instance { class, fields } }
    }

    /// A fresh container.
    pub const fn container(identity_hash: i32, container: TypedContainer) -> Self {
        Self { identity_hash, body: ObjectBody::Container(container) }
    }

    /// Every non-null reference the object holds, in field or element order.
    pub fn references(&self) -> Vec<InstanceId> {
        match &self.body {
            ObjectBody::Instance { fields, .. } => {
                fields.iter().filter_map(Value::referent).collect()
            }
            ObjectBody::Container(container) => container.references().collect(),
        }
    }

    /// Encodes the object as a storage record.
    ///
    /// An instance record is its tag, its class index and its two regions split at `boundary`;
    /// a container record is its tag, its element kind, its identity hash, its length and its
    /// elements.
    pub fn encode(
        &self,
        registry: &TypeRegistry,
        boundary: SplitBoundary,
    ) -> Result<Vec<u8>, StreamCorruption> {
        let mut enc = Encoder::new();
        match &self.body {
            ObjectBody::Instance { class, fields } => {
                let layout = registry.layout_of_record(class.0)?;
                enc.encode_u8(INSTANCE_RECORD_TAG).encode_u16(class.0);
                layout.encode_fields(self.identity_hash, fields, boundary, &mut enc)?;
            }
            ObjectBody::Container(container) => {
                enc.encode_u8(CONTAINER_RECORD_TAG)
                    .encode_u8(container.kind().tag())
                    .encode_int(self.identity_hash);
                container.serialize_elements(&mut enc);
            }
        }
        Ok(enc.into_vec())
    }

    /// Decodes a record written by [`HeapObject::encode`] with the same boundary. The whole
    /// record must be consumed.
    pub fn decode(
        bytes: &[u8],
        registry: &TypeRegistry,
        boundary: SplitBoundary,
    ) -> Result<Self, StreamCorruption> {
        let mut dec = Decoder::new(bytes);
        let object = match dec.decode_u8()? {
            INSTANCE_RECORD_TAG => {
                let index = dec.decode_u16()?;
                let layout = registry.layout_of_record(index)?;
                let (identity_hash, fields) = layout.decode_fields(boundary, &mut dec)?;
                Self::instance(identity_hash, layout.id, fields)
            }
            CONTAINER_RECORD_TAG => {
                let kind = TypedContainer::decode_kind(&mut dec)?;
                let identity_hash = dec.decode_int()?;
                let elements = TypedContainer::deserialize_elements(kind, &mut dec)?;
                Self::container(identity_hash, elements)
            }
            tag => return Err(StreamCorruption::UnknownRecordTag { tag }),
        };
        dec.finish()?;
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::CodecError, ElementKind};

    #[test]
    fn test_container_record_layout() {
        let registry = TypeRegistry::new();
        let mut container = TypedContainer::new(ElementKind::Short, 2).unwrap();
        container.set(1, Value::Int(-2)).unwrap();
        let object = HeapObject::container(7, container);
        let bytes = object.encode(&registry, SplitBoundary::Registered).unwrap();
        assert_eq!(
            bytes,
            vec![2, ElementKind::Short.tag(), 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0xff, 0xfe]
        );
        let decoded = HeapObject::decode(&bytes, &registry, SplitBoundary::Registered).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_corrupt_records() {
        let registry = TypeRegistry::new();
        assert_eq!(
            HeapObject::decode(&[9], &registry, SplitBoundary::Registered),
            Err(StreamCorruption::UnknownRecordTag { tag: 9 })
        );
        assert_eq!(
            HeapObject::decode(&[1, 0xff, 0xff], &registry, SplitBoundary::Registered),
            Err(StreamCorruption::UnknownClass { index: 0xffff })
        );
        assert_eq!(
            HeapObject::decode(&[1, 0, 0, 0, 0], &registry, SplitBoundary::Registered),
            Err(StreamCorruption::Codec(CodecError::StreamExhausted { needed: 4, remaining: 2 }))
        );
        assert_eq!(
            HeapObject::decode(&[1, 0, 0, 0, 0, 0, 0, 1], &registry, SplitBoundary::Registered),
            Err(StreamCorruption::Codec(CodecError::TrailingBytes { remaining: 1 }))
        );
    }
}
