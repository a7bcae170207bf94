//! Type registration and the field layout of persisted instances.
//!
//! Every type is registered once, parents before children, and receives an ordered list of
//! [`FieldGroup`]s: one per class of its ancestry, base to derived. Each group belongs either to
//! the automatic region, encoded by the runtime, or to the manual region, encoded by the
//! [`ManualFieldCodec`] its owner registered. The split is computed at registration and never
//! changes afterwards; a single serialization may still move it with a [`SplitBoundary`].

use std::{collections::HashMap, fmt, sync::Arc};

use auto_impl::auto_impl;

use crate::{
    builtins::{self, BUILTIN_TYPES},
    codec::{Decoder, Encoder},
    FieldKind, InstanceId, StreamCorruption, Value,
};

/// The index of a registered type.
///
/// Built-in types come first, in table order, followed by the module's classes. The index is
/// what persisted instance records store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[display("{_0}")]
pub struct ClassId(pub u16);

impl ClassId {
    /// The universal base type.
    pub const OBJECT: Self = Self(0);
}

/// Which side of the split a field group is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Encoded by the runtime in declaration order.
    Automatic,
    /// Encoded by the owner's [`ManualFieldCodec`].
    Manual,
}

/// The instance fields one class of a hierarchy contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
    /// The declaring class.
    pub owner: ClassId,
    /// The region the group is registered in.
    pub region: Region,
    /// Position of the group's first field in the instance's field vector.
    pub offset: usize,
    /// Kinds of the declared fields.
    pub kinds: Vec<FieldKind>,
}

impl FieldGroup {
    /// The group's range in the instance's field vector.
    pub fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.kinds.len()
    }
}

/// A declared field, as laid out in an instance or in the static area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    /// The declaring class.
    pub owner: ClassId,
    /// Field name.
    pub name: String,
    /// Field kind.
    pub kind: FieldKind,
}

/// Encodes and decodes the fields of one group in the manual region.
#[auto_impl(&, Box, Arc)]
pub trait ManualFieldCodec: fmt::Debug + Send + Sync {
    /// Writes the group's field values.
    fn encode(&self, kinds: &[FieldKind], values: &[Value], enc: &mut Encoder);

    /// Reads the group's field values back.
    fn decode(
        &self,
        kinds: &[FieldKind],
        dec: &mut Decoder<'_>,
    ) -> Result<Vec<Value>, StreamCorruption>;
}

/// Writes every field in declaration order with its fixed-width encoding. This is also how the
/// runtime encodes the automatic region.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredFieldCodec;

impl ManualFieldCodec for DeclaredFieldCodec {
    fn encode(&self, kinds: &[FieldKind], values: &[Value], enc: &mut Encoder) {
        for (kind, value) in kinds.iter().zip(values) {
            value.encode_as(*kind, enc);
        }
    }

    fn decode(
        &self,
        kinds: &[FieldKind],
        dec: &mut Decoder<'_>,
    ) -> Result<Vec<Value>, StreamCorruption> {
        kinds.iter().map(|kind| Ok(Value::decode_as(*kind, dec)?)).collect()
    }
}

/// The throwable base writes its status code and a presence flag in front of the cause id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrowableCodec;

impl ManualFieldCodec for ThrowableCodec {
    fn encode(&self, _kinds: &[FieldKind], values: &[Value], enc: &mut Encoder) {
        let code = values.first().and_then(Value::as_int).unwrap_or_default();
        let cause = values.get(1).and_then(Value::referent);
        enc.encode_int(code).encode_bool(cause.is_some());
        if let Some(cause) = cause {
            enc.encode_u64(cause.0);
        }
    }

    fn decode(
        &self,
        _kinds: &[FieldKind],
        dec: &mut Decoder<'_>,
    ) -> Result<Vec<Value>, StreamCorruption> {
        let code = dec.decode_int()?;
        let cause = if dec.decode_bool()? { Some(InstanceId(dec.decode_u64()?)) } else { None };
        Ok(vec![Value::Int(code), Value::Ref(cause)])
    }
}

/// Where a single serialization splits the automatic region from the manual one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SplitBoundary {
    /// The boundary fixed at registration.
    #[default]
    Registered,
    /// Every group in the automatic region.
    AllAutomatic,
    /// Groups from this ancestor down are manual.
    At(ClassId),
}

/// The registered layout of one type.
#[derive(Debug, Clone)]
pub struct TypeLayout {
    /// The type's index.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Direct superclass; only the universal base has none.
    pub super_class: Option<ClassId>,
    /// The type and its ancestors, base first.
    pub chain: Vec<ClassId>,
    /// One group per class of `chain`, in the same order.
    pub groups: Vec<FieldGroup>,
    /// Every instance field, base first.
    pub fields: Vec<FieldSlot>,
    /// Index into `groups` of the first manual group, `groups.len()` if all are automatic.
    pub boundary: usize,
    codecs: Vec<Arc<dyn ManualFieldCodec>>,
}

impl TypeLayout {
    /// Number of instance fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Whether `ancestor` is this type or one of its ancestors.
    pub fn is_subtype_of(&self, ancestor: ClassId) -> bool {
        self.chain.contains(&ancestor)
    }

    /// The index of a field, searched from the most derived class up, as field references
    /// resolve.
    pub fn field_index(&self, owner: ClassId, name: &str) -> Option<usize> {
        let start = self.chain.iter().position(|&c| c == owner)?;
        self.chain[..=start].iter().rev().find_map(|&class| {
            self.fields.iter().position(|field| field.owner == class && field.name == name)
        })
    }

    /// Zero values of every instance field.
    pub fn default_fields(&self) -> Vec<Value> {
        self.fields.iter().map(|field| Value::default_of(field.kind)).collect()
    }

    fn split_at(&self, boundary: SplitBoundary) -> Result<usize, StreamCorruption> {
        match boundary {
            SplitBoundary::Registered => Ok(self.boundary),
            SplitBoundary::AllAutomatic => Ok(self.groups.len()),
            SplitBoundary::At(class) => self.chain.iter().position(|&c| c == class).ok_or(
                StreamCorruption::BoundaryNotInHierarchy { class: self.id, boundary: class },
            ),
        }
    }

    /// Encodes an instance's regions: the identity hash and the automatic groups, then the
    /// manual groups base to derived.
    pub fn encode_fields(
        &self,
        identity_hash: i32,
        fields: &[Value],
        boundary: SplitBoundary,
        enc: &mut Encoder,
    ) -> Result<(), StreamCorruption> {
        let split = self.split_at(boundary)?;
        enc.encode_int(identity_hash);
        for (i, group) in self.groups.iter().enumerate() {
            let values = fields.get(group.range()).unwrap_or_default();
            if i < split {
                DeclaredFieldCodec.encode(&group.kinds, values, enc);
            } else {
                self.codecs[i].encode(&group.kinds, values, enc);
            }
        }
        Ok(())
    }

    /// Decodes regions written by [`TypeLayout::encode_fields`] with the same boundary.
    pub fn decode_fields(
        &self,
        boundary: SplitBoundary,
        dec: &mut Decoder<'_>,
    ) -> Result<(i32, Vec<Value>), StreamCorruption> {
        let split = self.split_at(boundary)?;
        let identity_hash = dec.decode_int()?;
        let mut fields = Vec::with_capacity(self.fields.len());
        for (i, group) in self.groups.iter().enumerate() {
            let values = if i < split {
                DeclaredFieldCodec.decode(&group.kinds, dec)?
            } else {
                self.codecs[i].decode(&group.kinds, dec)?
            };
            fields.extend(values.into_iter().take(group.kinds.len()));
            // A manual codec that produced too few values leaves the remainder zeroed.
            while fields.len() < group.range().end {
                fields.push(Value::default_of(group.kinds[fields.len() - group.offset]));
            }
        }
        Ok((identity_hash, fields))
    }
}

/// Errors raised while registering types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The type is already registered.
    #[error("type {name} registered twice")]
    Duplicate {
        /// Class name.
        name: String,
    },
    /// The parent is not registered yet.
    #[error("type {name} extends unregistered type {super_name}")]
    UnknownParent {
        /// Class name.
        name: String,
        /// The missing parent.
        super_name: String,
    },
    /// A field descriptor does not parse.
    #[error("type {name} declares field {field} with malformed descriptor")]
    BadField {
        /// Class name.
        name: String,
        /// Field name.
        field: String,
    },
    /// Too many types.
    #[error("type table is full")]
    Full,
}

/// Every type of one code unit, with its layout and statics.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    layouts: Vec<TypeLayout>,
    by_name: HashMap<String, ClassId>,
    statics: Vec<FieldSlot>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry holding the built-in types.
    pub fn new() -> Self {
        let mut registry =
            Self { layouts: Vec::new(), by_name: HashMap::new(), statics: Vec::new() };
        for ty in BUILTIN_TYPES {
            let codec: Option<Arc<dyn ManualFieldCodec>> = match ty.name {
                builtins::THROWABLE => Some(Arc::new(ThrowableCodec)),
                _ => None,
            };
            let fields = ty.fields.iter().map(|(name, desc)| (name.to_string(), desc.to_string()));
            let registered = registry.register_with_codec(
                ty.name,
                ty.super_name,
                fields.collect(),
                Vec::new(),
                codec,
            );
            debug_assert!(registered.is_ok(), "built-in type table is consistent");
        }
        registry
    }

    /// Registers a type with default encoding.
    pub fn register(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: Vec<(String, String)>,
        statics: Vec<(String, String)>,
    ) -> Result<ClassId, RegistrationError> {
        self.register_with_codec(name, super_name, fields, statics, None)
    }

    /// Registers a type, optionally with a manual codec for its own group.
    ///
    /// The registered boundary is the first class of the ancestry, base first, that has a
    /// manual codec; every group from there down is in the manual region. Groups of classes
    /// without a codec of their own are then encoded with [`DeclaredFieldCodec`].
    pub fn register_with_codec(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: Vec<(String, String)>,
        statics: Vec<(String, String)>,
        codec: Option<Arc<dyn ManualFieldCodec>>,
    ) -> Result<ClassId, RegistrationError> {
        if self.by_name.contains_key(name) {
            return Err(RegistrationError::Duplicate { name: name.to_owned() });
        }
        let id = ClassId(u16::try_from(self.layouts.len()).map_err(|_| RegistrationError::Full)?);
        let parent = match super_name {
            Some(super_name) => Some(self.layout_by_name(super_name).ok_or_else(|| {
                RegistrationError::UnknownParent {
                    name: name.to_owned(),
                    super_name: super_name.to_owned(),
                }
            })?),
            None => None,
        };

        let parse = |fields: Vec<(String, String)>| {
            fields
                .into_iter()
                .map(|(field, descriptor)| {
                    let kind = FieldKind::parse(&descriptor).map_err(|_| {
                        RegistrationError::BadField { name: name.to_owned(), field: field.clone() }
                    })?;
                    Ok(FieldSlot { owner: id, name: field, kind })
                })
                .collect::<Result<Vec<_>, RegistrationError>>()
        };
        let own_fields = parse(fields)?;
        let own_statics = parse(statics)?;

        let (mut chain, mut groups, mut all_fields, mut codecs, inherited_boundary) = match parent {
            Some(parent) => (
                parent.chain.clone(),
                parent.groups.clone(),
                parent.fields.clone(),
                parent.codecs.clone(),
                (parent.boundary < parent.groups.len()).then_some(parent.boundary),
            ),
            None => (Vec::new(), Vec::new(), Vec::new(), Vec::new(), None),
        };
        let super_class = parent.map(|parent| parent.id);

        let boundary = inherited_boundary
            .or_else(|| codec.is_some().then_some(groups.len()))
            .unwrap_or(usize::MAX);
        let region = if groups.len() >= boundary { Region::Manual } else { Region::Automatic };
        for group in groups.iter_mut().skip(boundary) {
            group.region = Region::Manual;
        }
        chain.push(id);
        groups.push(FieldGroup {
            owner: id,
            region,
            offset: all_fields.len(),
            kinds: own_fields.iter().map(|field| field.kind).collect(),
        });
        codecs.push(codec.unwrap_or_else(|| Arc::new(DeclaredFieldCodec)));
        all_fields.extend(own_fields);

        let layout = TypeLayout {
            id,
            name: name.to_owned(),
            super_class,
            boundary: boundary.min(groups.len()),
            chain,
            groups,
            fields: all_fields,
            codecs,
        };
        self.by_name.insert(name.to_owned(), id);
        self.layouts.push(layout);
        self.statics.extend(own_statics);
        Ok(id)
    }

    /// The layout of a registered type.
    pub fn layout(&self, id: ClassId) -> Option<&TypeLayout> {
        self.layouts.get(id.0 as usize)
    }

    /// The layout of a type stored in a record, failing on an unknown index.
    pub fn layout_of_record(&self, index: u16) -> Result<&TypeLayout, StreamCorruption> {
        self.layout(ClassId(index)).ok_or(StreamCorruption::UnknownClass { index })
    }

    /// Looks up a type by name.
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    fn layout_by_name(&self, name: &str) -> Option<&TypeLayout> {
        self.lookup(name).and_then(|id| self.layout(id))
    }

    /// Whether `class` is `ancestor` or derives from it.
    pub fn is_subtype(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.layout(class).is_some_and(|layout| layout.is_subtype_of(ancestor))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Every static field, in registration order.
    pub fn statics(&self) -> &[FieldSlot] {
        &self.statics
    }

    /// The slot of a static field, searched from `owner` up its ancestry.
    pub fn static_index(&self, owner: ClassId, name: &str) -> Option<usize> {
        let layout = self.layout(owner)?;
        layout.chain.iter().rev().find_map(|&class| {
            self.statics.iter().position(|field| field.owner == class && field.name == name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(n, d)| (n.to_string(), d.to_string())).collect()
    }

    #[test]
    fn test_builtins_are_registered_first() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.len(), BUILTIN_TYPES.len());
        assert_eq!(registry.lookup(builtins::OBJECT), Some(ClassId::OBJECT));
        let throwable = registry.lookup(builtins::THROWABLE).unwrap();
        let npe = registry.layout(registry.lookup("avm/NullPointerException").unwrap()).unwrap();
        assert!(npe.is_subtype_of(throwable));
        // Throwable registered a manual codec, so everything from it down is manual.
        assert_eq!(npe.boundary, 1);
        assert_eq!(npe.groups[0].region, Region::Automatic);
        assert!(npe.groups[1..].iter().all(|g| g.region == Region::Manual));
    }

    #[test]
    fn test_groups_are_ordered_base_to_derived() {
        let mut registry = TypeRegistry::new();
        let a = registry.register("A", None, fields(&[("x", "I")]), vec![]).unwrap();
        let b = registry
            .register("B", Some("A"), fields(&[("y", "J"), ("x", "I")]), fields(&[("s", "Z")]))
            .unwrap();
        let layout = registry.layout(b).unwrap();
        assert_eq!(layout.chain, vec![a, b]);
        assert_eq!(layout.groups[1].offset, 1);
        assert_eq!(layout.field_count(), 3);
        // The derived field shadows the inherited one of the same name.
        assert_eq!(layout.field_index(b, "x"), Some(2));
        assert_eq!(layout.field_index(a, "x"), Some(0));
        assert_eq!(registry.static_index(b, "s"), Some(0));
        assert_eq!(layout.boundary, layout.groups.len());
    }

    #[test]
    fn test_foreign_boundary_is_corruption() {
        let mut registry = TypeRegistry::new();
        let a = registry.register("A", None, vec![], vec![]).unwrap();
        let b = registry.register("B", None, vec![], vec![]).unwrap();
        let layout = registry.layout(a).unwrap();
        let mut enc = Encoder::new();
        assert_eq!(
            layout.encode_fields(0, &[], SplitBoundary::At(b), &mut enc),
            Err(StreamCorruption::BoundaryNotInHierarchy { class: a, boundary: b })
        );
    }

    #[test]
    fn test_registration_errors() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register("A", Some("Missing"), vec![], vec![]),
            Err(RegistrationError::UnknownParent { .. })
        ));
        registry.register("A", None, vec![], vec![]).unwrap();
        assert!(matches!(
            registry.register("A", None, vec![], vec![]),
            Err(RegistrationError::Duplicate { .. })
        ));
        assert!(matches!(
            registry.register("C", None, fields(&[("f", "Q")]), vec![]),
            Err(RegistrationError::BadField { .. })
        ));
    }
}
