//! The binary layout of a deployable contract module.
//!
//! A module is the `classBytes` payload submitted at deployment: a main class name followed by
//! every class of the contract. Each class carries its own 1-based constant pool, its declared
//! fields, and its methods with raw code bytes and exception tables.
//!
//! ```text
//! u32 magic | u16 version | str main_class | u16 class_count | class*
//! class  := str name | str super_name ("" = universal base) | u16 access
//!           | u16 pool_count | entry* | u16 field_count | field* | u16 method_count | method*
//! field  := u16 access | str name | str descriptor
//! method := u16 access | str name | str descriptor | bytes code | u16 handler_count | handler*
//! handler:= u16 start_pc | u16 end_pc | u16 handler_pc | u16 catch_type (0 = any)
//! ```

mod descriptor;
pub use descriptor::*;

use alloy_primitives::{Address, Bytes};
use bitflags::bitflags;

use crate::{
    codec::{CodecError, Decoder, Encoder},
    constants::format::{MODULE_MAGIC, MODULE_VERSION},
};

bitflags! {
    /// Access and property flags of classes, fields and methods.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        /// Visible everywhere.
        const PUBLIC = 1 << 0;
        /// Visible only within the declaring class.
        const PRIVATE = 1 << 1;
        /// Visible to subclasses.
        const PROTECTED = 1 << 2;
        /// Belongs to the class rather than to an instance.
        const STATIC = 1 << 3;
        /// Cannot be overridden or reassigned.
        const FINAL = 1 << 4;
        /// Declared without an implementation.
        const ABSTRACT = 1 << 10;
    }
}

/// Errors raised while decoding a contract module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The underlying stream was malformed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The payload does not start with the module magic.
    #[error("bad module magic: {found:#010x}")]
    BadMagic {
        /// The magic that was found.
        found: u32,
    },
    /// The module was written for an unsupported format version.
    #[error("unsupported module version: {version}")]
    UnsupportedVersion {
        /// The declared version.
        version: u16,
    },
    /// A constant pool entry carries an unknown tag.
    #[error("unknown constant pool tag: {tag}")]
    UnknownPoolTag {
        /// The tag byte.
        tag: u8,
    },
    /// A method reference carries an unknown owner tag.
    #[error("unknown method owner tag: {tag}")]
    UnknownOwnerTag {
        /// The tag byte.
        tag: u8,
    },
}

/// A reference to a field through the constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Pool index of the owning class entry.
    pub class: u16,
    /// Field name.
    pub name: String,
    /// Field descriptor.
    pub descriptor: String,
}

/// The owner of a referenced method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodOwner {
    /// A class of this module (or a built-in), by pool index of its class entry.
    Class(u16),
    /// The main class of another deployed contract.
    Contract(Address),
}

/// A reference to a method through the constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Who declares the method.
    pub owner: MethodOwner,
    /// Method name.
    pub name: String,
    /// Method descriptor.
    pub descriptor: String,
}

/// A constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    /// An `int` literal.
    Int(i32),
    /// A `long` literal.
    Long(i64),
    /// A `float` literal.
    Float(f32),
    /// A `double` literal.
    Double(f64),
    /// A class name, in internal form (`a/b/C`, `[I`).
    Class(String),
    /// A field reference.
    Field(FieldRef),
    /// A method reference.
    Method(MethodRef),
}

impl PoolEntry {
    const TAG_INT: u8 = 1;
    const TAG_LONG: u8 = 2;
    const TAG_FLOAT: u8 = 3;
    const TAG_DOUBLE: u8 = 4;
    const TAG_CLASS: u8 = 5;
    const TAG_FIELD: u8 = 6;
    const TAG_METHOD: u8 = 7;

    fn encode(&self, enc: &mut Encoder) {
        match self {
            Self::Int(value) => {
                enc.encode_u8(Self::TAG_INT).encode_int(*value);
            }
            Self::Long(value) => {
                enc.encode_u8(Self::TAG_LONG).encode_long(*value);
            }
            Self::Float(value) => {
                enc.encode_u8(Self::TAG_FLOAT).encode_float(*value);
            }
            Self::Double(value) => {
                enc.encode_u8(Self::TAG_DOUBLE).encode_double(*value);
            }
            Self::Class(name) => {
                enc.encode_u8(Self::TAG_CLASS).encode_str(name);
            }
            Self::Field(field) => {
                enc.encode_u8(Self::TAG_FIELD)
                    .encode_u16(field.class)
                    .encode_str(&field.name)
                    .encode_str(&field.descriptor);
            }
            Self::Method(method) => {
                enc.encode_u8(Self::TAG_METHOD);
                match method.owner {
                    MethodOwner::Class(index) => {
                        enc.encode_u8(0).encode_u16(index);
                    }
                    MethodOwner::Contract(address) => {
                        enc.encode_u8(1).encode_raw(address.as_slice());
                    }
                }
                enc.encode_str(&method.name).encode_str(&method.descriptor);
            }
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, FormatError> {
        Ok(match dec.decode_u8()? {
            Self::TAG_INT => Self::Int(dec.decode_int()?),
            Self::TAG_LONG => Self::Long(dec.decode_long()?),
            Self::TAG_FLOAT => Self::Float(dec.decode_float()?),
            Self::TAG_DOUBLE => Self::Double(dec.decode_double()?),
            Self::TAG_CLASS => Self::Class(dec.decode_str()?),
            Self::TAG_FIELD => Self::Field(FieldRef {
                class: dec.decode_u16()?,
                name: dec.decode_str()?,
                descriptor: dec.decode_str()?,
            }),
            Self::TAG_METHOD => {
                let owner = match dec.decode_u8()? {
                    0 => MethodOwner::Class(dec.decode_u16()?),
                    1 => MethodOwner::Contract(Address::from_slice(dec.decode_raw(20)?)),
                    tag => return Err(FormatError::UnknownOwnerTag { tag }),
                };
                Self::Method(MethodRef {
                    owner,
                    name: dec.decode_str()?,
                    descriptor: dec.decode_str()?,
                })
            }
            tag => return Err(FormatError::UnknownPoolTag { tag }),
        })
    }
}

/// A class's constant pool. Indices are 1-based; index `0` never resolves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
}

impl ConstantPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entry by its 1-based index.
    pub fn get(&self, index: u16) -> Option<&PoolEntry> {
        (index as usize).checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Appends an entry and returns its index.
    pub fn push(&mut self, entry: PoolEntry) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    /// Returns the index of an equal entry, appending it if absent.
    pub fn intern(&mut self, entry: PoolEntry) -> u16 {
        match self.entries.iter().position(|existing| *existing == entry) {
            Some(i) => i as u16 + 1,
            None => self.push(entry),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(index, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &PoolEntry)> {
        self.entries.iter().enumerate().map(|(i, entry)| (i as u16 + 1, entry))
    }

    /// The class name of a class entry.
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            PoolEntry::Class(name) => Some(name),
            _ => None,
        }
    }

    /// The field reference at `index`.
    pub fn field_ref(&self, index: u16) -> Option<&FieldRef> {
        match self.get(index)? {
            PoolEntry::Field(field) => Some(field),
            _ => None,
        }
    }

    /// The method reference at `index`.
    pub fn method_ref(&self, index: u16) -> Option<&MethodRef> {
        match self.get(index)? {
            PoolEntry::Method(method) => Some(method),
            _ => None,
        }
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Access flags; [`AccessFlags::STATIC`] marks class fields.
    pub access: AccessFlags,
    /// Field name.
    pub name: String,
    /// Field descriptor.
    pub descriptor: String,
}

impl FieldInfo {
    /// Whether the field belongs to the class rather than to instances.
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

/// One exception table entry, in byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered byte offset.
    pub start_pc: u16,
    /// First byte offset past the covered range.
    pub end_pc: u16,
    /// Byte offset of the handler.
    pub handler_pc: u16,
    /// Pool index of the caught class, `0` catches everything.
    pub catch_type: u16,
}

/// A declared method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Access flags.
    pub access: AccessFlags,
    /// Method name.
    pub name: String,
    /// Method descriptor.
    pub descriptor: String,
    /// Raw code bytes.
    pub code: Bytes,
    /// Exception table.
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodInfo {
    /// Whether the method has no receiver.
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

/// One class of a contract module.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    /// Class name, in internal form.
    pub name: String,
    /// Superclass name; `None` extends the universal base type.
    pub super_name: Option<String>,
    /// Access flags.
    pub access: AccessFlags,
    /// The constant pool.
    pub pool: ConstantPool,
    /// Declared fields.
    pub fields: Vec<FieldInfo>,
    /// Declared methods.
    pub methods: Vec<MethodInfo>,
}

impl ClassFile {
    fn encode(&self, enc: &mut Encoder) {
        enc.encode_str(&self.name)
            .encode_str(self.super_name.as_deref().unwrap_or_default())
            .encode_u16(self.access.bits())
            .encode_u16(self.pool.len() as u16);
        for (_, entry) in self.pool.iter() {
            entry.encode(enc);
        }
        enc.encode_u16(self.fields.len() as u16);
        for field in &self.fields {
            enc.encode_u16(field.access.bits())
                .encode_str(&field.name)
                .encode_str(&field.descriptor);
        }
        enc.encode_u16(self.methods.len() as u16);
        for method in &self.methods {
            enc.encode_u16(method.access.bits())
                .encode_str(&method.name)
                .encode_str(&method.descriptor)
                .encode_bytes(&method.code)
                .encode_u16(method.handlers.len() as u16);
            for handler in &method.handlers {
                enc.encode_u16(handler.start_pc)
                    .encode_u16(handler.end_pc)
                    .encode_u16(handler.handler_pc)
                    .encode_u16(handler.catch_type);
            }
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, FormatError> {
        let name = dec.decode_str()?;
        let super_name = Some(dec.decode_str()?).filter(|name| !name.is_empty());
        let access = AccessFlags::from_bits_truncate(dec.decode_u16()?);

        let mut pool = ConstantPool::new();
        for _ in 0..dec.decode_u16()? {
            pool.push(PoolEntry::decode(dec)?);
        }

        let field_count = dec.decode_u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(FieldInfo {
                access: AccessFlags::from_bits_truncate(dec.decode_u16()?),
                name: dec.decode_str()?,
                descriptor: dec.decode_str()?,
            });
        }

        let method_count = dec.decode_u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access = AccessFlags::from_bits_truncate(dec.decode_u16()?);
            let name = dec.decode_str()?;
            let descriptor = dec.decode_str()?;
            let code = Bytes::copy_from_slice(dec.decode_bytes()?);
            let handler_count = dec.decode_u16()?;
            let mut handlers = Vec::with_capacity(handler_count as usize);
            for _ in 0..handler_count {
                handlers.push(ExceptionHandler {
                    start_pc: dec.decode_u16()?,
                    end_pc: dec.decode_u16()?,
                    handler_pc: dec.decode_u16()?,
                    catch_type: dec.decode_u16()?,
                });
            }
            methods.push(MethodInfo { access, name, descriptor, code, handlers });
        }

        Ok(Self { name, super_name, access, pool, fields, methods })
    }

    /// Looks up a declared method by name and descriptor.
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name && m.descriptor == descriptor)
    }
}

/// A complete contract module, as submitted for deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractModule {
    /// Name of the class whose static methods are the contract's entry points.
    pub main_class: String,
    /// Every class of the contract.
    pub classes: Vec<ClassFile>,
}

impl ContractModule {
    /// Decodes a module from its binary form. The whole payload must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut dec = Decoder::new(bytes);
        let magic = dec.decode_u32()?;
        if magic != MODULE_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let version = dec.decode_u16()?;
        if version != MODULE_VERSION {
            return Err(FormatError::UnsupportedVersion { version });
        }
        let main_class = dec.decode_str()?;
        let class_count = dec.decode_u16()?;
        let mut classes = Vec::with_capacity(class_count as usize);
        for _ in 0..class_count {
            classes.push(ClassFile::decode(&mut dec)?);
        }
        dec.finish()?;
        Ok(Self { main_class, classes })
    }

    /// Encodes the module to its binary form.
    pub fn encode(&self) -> Bytes {
        let mut enc = Encoder::new();
        enc.encode_u32(MODULE_MAGIC)
            .encode_u16(MODULE_VERSION)
            .encode_str(&self.main_class)
            .encode_u16(self.classes.len() as u16);
        for class in &self.classes {
            class.encode(&mut enc);
        }
        enc.finish()
    }

    /// Looks up a class by name.
    pub fn class(&self, name: &str) -> Option<&ClassFile> {
        self.classes.iter().find(|class| class.name == name)
    }
}
