//! Linking of a validated module into an immutable [`CodeUnit`].
//!
//! [`validate_and_rewrite`] is the whole deployment pipeline: decode the module, check its
//! shape, register its types, validate every method, resolve every constant pool entry
//! against the type registry and finally rewrite array instructions into container calls. The
//! result is shared read-only between invocations and threads.

use std::{collections::HashSet, sync::Arc};

use alloy_primitives::{keccak256, Address, B256};
use tracing::{debug, info};

use crate::{
    builtins::{self, BUILTIN_TYPES},
    bytecode::{opcode::*, Instruction, Operand},
    rewrite::rewrite_method,
    validate::{validate_class, validate_module_shape, MethodRejection, ShapeViolation},
    AccessFlags, ClassFile, ClassId, ContractModule, ElementKind, FieldInfo, FieldKind,
    MethodDescriptor, MethodOwner, PoolEntry, RegistrationError, StaticRejection, TypeRegistry,
    ValidationLimits, VerifiedMethod,
};

/// A reference that does not resolve, or resolves to the wrong kind of member.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// A class entry names a class that exists neither in the module nor among the built-ins.
    #[error("class {class} references unknown class {name}")]
    UnknownClass {
        /// The referencing class.
        class: String,
        /// The unknown name.
        name: String,
    },
    /// A field reference does not resolve.
    #[error("class {class} references unknown field {owner}.{name}")]
    UnknownField {
        /// The referencing class.
        class: String,
        /// The field's owner.
        owner: String,
        /// The field name.
        name: String,
    },
    /// A field reference's descriptor disagrees with the declaration.
    #[error("class {class} references field {name} with mismatched descriptor {descriptor}")]
    FieldKindMismatch {
        /// The referencing class.
        class: String,
        /// The field name.
        name: String,
        /// The referenced descriptor.
        descriptor: String,
    },
    /// A method reference does not resolve.
    #[error("class {class} references unknown method {owner}.{name}{descriptor}")]
    UnknownMethod {
        /// The referencing class.
        class: String,
        /// The method's owner.
        owner: String,
        /// The method name.
        name: String,
        /// The method descriptor.
        descriptor: String,
    },
    /// An instruction uses a member as the wrong kind (static vs instance, class vs contract).
    #[error("instruction {at} of {class}.{method} uses pool entry {index} incompatibly")]
    IncompatibleUse {
        /// The referencing class.
        class: String,
        /// The method holding the instruction.
        method: String,
        /// Instruction index.
        at: usize,
        /// Pool index.
        index: u16,
    },
    /// The module's types could not be registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// A host native of the `avm/Blockchain` class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Native {
    /// `revert()V`: abort the invocation, discarding its writes.
    Revert,
    /// `remainingEnergy()J`: the budget left to the current call.
    RemainingEnergy,
    /// `selfDestruct()V`: remove the contract's code and state at the end of the activation.
    SelfDestruct,
}

impl Native {
    /// Resolves a native by name and descriptor.
    pub fn lookup(name: &str, descriptor: &str) -> Option<Self> {
        match (name, descriptor) {
            ("revert", "()V") => Some(Self::Revert),
            ("remainingEnergy", "()J") => Some(Self::RemainingEnergy),
            ("selfDestruct", "()V") => Some(Self::SelfDestruct),
            _ => None,
        }
    }
}

/// What a class entry of the pool resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassTarget {
    /// A registered type.
    Type(ClassId),
    /// An array type, represented by a container of this kind.
    Container(ElementKind),
}

/// What a field reference resolves to. A name may resolve both ways; the instruction decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldTarget {
    /// The class the reference names; an accessed instance must be of this type.
    pub owner: ClassId,
    /// Index into the instance's field vector, if an instance field matches.
    pub instance: Option<usize>,
    /// Slot in the static area, if a static field matches.
    pub static_slot: Option<usize>,
    /// The field's kind.
    pub kind: FieldKind,
}

/// A method of a code unit, by declaring class and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle {
    /// Declaring class.
    pub class: ClassId,
    /// Index into the class's methods.
    pub index: usize,
}

/// What a method reference resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodTarget {
    /// A method of this unit. Virtual calls re-resolve `name` and `descriptor` against the
    /// receiver's class.
    Class {
        /// The resolved method.
        handle: MethodHandle,
        /// Method name.
        name: String,
        /// Method descriptor.
        descriptor: String,
    },
    /// A host native.
    Native(Native),
    /// A static method of another contract's main class.
    Contract {
        /// The callee contract.
        address: Address,
        /// Method name.
        name: String,
        /// Method descriptor.
        descriptor: String,
    },
}

/// A resolved constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolTarget {
    /// Index 0, or an entry no instruction may use.
    Unused,
    /// `int` literal.
    Int(i32),
    /// `long` literal.
    Long(i64),
    /// `float` literal.
    Float(f32),
    /// `double` literal.
    Double(f64),
    /// A class.
    Class(ClassTarget),
    /// A field.
    Field(FieldTarget),
    /// A method.
    Method(MethodTarget),
}

/// A method ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedMethod {
    /// Method name.
    pub name: String,
    /// Method descriptor.
    pub descriptor: String,
    /// Parsed descriptor.
    pub signature: MethodDescriptor,
    /// Access flags.
    pub access: AccessFlags,
    /// Rewritten instructions with handler ranges and computed frame sizes.
    pub code: VerifiedMethod,
}

impl LinkedMethod {
    /// Whether the method has no receiver.
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    /// Whether the method has no code.
    pub fn is_abstract(&self) -> bool {
        self.code.instructions.is_empty()
    }
}

/// A class ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedClass {
    /// The class's type.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Methods, in declaration order.
    pub methods: Vec<LinkedMethod>,
    /// The resolved constant pool, indexed like the original.
    pub pool: Vec<PoolTarget>,
}

impl LinkedClass {
    /// Finds a declared method.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name && m.descriptor == descriptor)
    }

    /// A resolved pool entry.
    pub fn pool_entry(&self, index: u16) -> &PoolTarget {
        self.pool.get(index as usize).unwrap_or(&PoolTarget::Unused)
    }
}

/// One contract's validated, linked and rewritten classes.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    hash: B256,
    code_len: usize,
    main_class: ClassId,
    registry: Arc<TypeRegistry>,
    classes: Vec<LinkedClass>,
    rewritten: usize,
}

impl CodeUnit {
    /// Hash of the module bytes the unit was built from.
    pub const fn hash(&self) -> B256 {
        self.hash
    }

    /// Size of the module bytes.
    pub const fn code_len(&self) -> usize {
        self.code_len
    }

    /// The class whose static methods are the entry points.
    pub const fn main_class(&self) -> ClassId {
        self.main_class
    }

    /// The unit's types.
    pub const fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Every class, built-ins first, indexed by [`ClassId`].
    pub fn classes(&self) -> &[LinkedClass] {
        &self.classes
    }

    /// A class by id.
    pub fn class(&self, id: ClassId) -> Option<&LinkedClass> {
        self.classes.get(id.0 as usize)
    }

    /// A method by handle.
    pub fn method(&self, handle: MethodHandle) -> Option<&LinkedMethod> {
        self.class(handle.class)?.methods.get(handle.index)
    }

    /// Number of instructions the rewriter replaced across the unit.
    pub const fn rewritten_instructions(&self) -> usize {
        self.rewritten
    }

    /// Resolves a method by walking from `class` up its ancestry.
    pub fn resolve(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodHandle> {
        let layout = self.registry.layout(class)?;
        layout.chain.iter().rev().find_map(|&ancestor| {
            let index = self.class(ancestor)?.find_method(name, descriptor)?;
            Some(MethodHandle { class: ancestor, index })
        })
    }

    /// A public static method of the main class.
    pub fn entry_point(&self, name: &str, descriptor: &str) -> Option<MethodHandle> {
        let index = self.class(self.main_class)?.find_method(name, descriptor)?;
        let handle = MethodHandle { class: self.main_class, index };
        let method = self.method(handle)?;
        (method.is_static() && !name.starts_with('<')).then_some(handle)
    }

    /// Class initializers of the module's classes, parents first.
    pub fn initializers(&self) -> impl Iterator<Item = MethodHandle> + '_ {
        self.classes.iter().skip(BUILTIN_TYPES.len()).filter_map(|class| {
            let index = class.find_method("<clinit>", "()V")?;
            Some(MethodHandle { class: class.id, index })
        })
    }
}

/// Validates, links and rewrites a contract module.
///
/// This is a pure function of its inputs: the same bytes and limits always produce the same
/// unit or the same rejection.
pub fn validate_and_rewrite(
    class_bytes: &[u8],
    limits: &ValidationLimits,
) -> Result<CodeUnit, StaticRejection> {
    let module = ContractModule::decode(class_bytes)?;
    validate_module_shape(&module, limits)?;

    let ordered = hierarchy_order(&module);
    let mut registry = TypeRegistry::new();
    for class in &ordered {
        let (statics, fields): (Vec<_>, Vec<_>) =
            class.fields.iter().partition(|field| field.is_static());
        let pairs = |list: Vec<&FieldInfo>| -> Vec<(String, String)> {
            list.into_iter().map(|f| (f.name.clone(), f.descriptor.clone())).collect()
        };
        registry
            .register(
                &class.name,
                Some(class.super_name.as_deref().unwrap_or(builtins::OBJECT)),
                pairs(fields),
                pairs(statics),
            )
            .map_err(LinkError::from)?;
    }

    let mut classes: Vec<LinkedClass> = BUILTIN_TYPES
        .iter()
        .enumerate()
        .map(|(i, ty)| builtin_class(ClassId(i as u16), ty.name))
        .collect();
    let mut rewritten = 0;
    for class in &ordered {
        let id = registry.lookup(&class.name).ok_or_else(|| LinkError::UnknownClass {
            class: class.name.clone(),
            name: class.name.clone(),
        })?;
        let verified = validate_class(class, limits)?;
        let methods = class
            .methods
            .iter()
            .zip(verified)
            .map(|(info, code)| {
                let signature = MethodDescriptor::parse(&info.descriptor)
                    .map_err(|e| reject(class, &info.name, &info.descriptor, e.into()))?;
                Ok(LinkedMethod {
                    name: info.name.clone(),
                    descriptor: info.descriptor.clone(),
                    signature,
                    access: info.access,
                    code,
                })
            })
            .collect::<Result<Vec<_>, StaticRejection>>()?;
        classes.push(LinkedClass { id, name: class.name.clone(), methods, pool: Vec::new() });
    }

    // Pools resolve once every class's methods are known.
    let mut resolved = Vec::with_capacity(ordered.len());
    for (class, linked) in ordered.iter().zip(&classes[BUILTIN_TYPES.len()..]) {
        let pool = resolve_pool(class, &registry, &classes)?;
        for method in &linked.methods {
            check_uses(class, &method.name, &method.code.instructions, &pool, &classes)?;
        }
        resolved.push(pool);
    }
    for ((class, pool), linked) in
        ordered.iter().zip(resolved).zip(classes.iter_mut().skip(BUILTIN_TYPES.len()))
    {
        for (info, method) in class.methods.iter().zip(linked.methods.iter_mut()) {
            let report = rewrite_method(
                &mut method.code,
                &class.pool,
                method.signature.ret,
                limits.max_operand_stack_depth,
            )
            .map_err(|e| reject(class, &info.name, &info.descriptor, e))?;
            rewritten += report.substitutions;
        }
        linked.pool = pool;
    }

    let main_class = registry.lookup(&module.main_class).ok_or_else(|| {
        StaticRejection::MissingMainClass { name: module.main_class.clone() }
    })?;
    let unit = CodeUnit {
        hash: keccak256(class_bytes),
        code_len: class_bytes.len(),
        main_class,
        registry: Arc::new(registry),
        classes,
        rewritten,
    };
    info!(
        target: "avm::unit",
        hash = %unit.hash,
        classes = ordered.len(),
        rewritten,
        "Module validated"
    );
    Ok(unit)
}

fn reject(
    class: &ClassFile,
    method: &str,
    descriptor: &str,
    violation: ShapeViolation,
) -> StaticRejection {
    MethodRejection {
        class: class.name.clone(),
        method: method.to_owned(),
        descriptor: descriptor.to_owned(),
        violation,
    }
    .into()
}

/// Orders the module's classes so every class follows its superclass.
fn hierarchy_order(module: &ContractModule) -> Vec<&ClassFile> {
    let mut ordered: Vec<&ClassFile> = Vec::with_capacity(module.classes.len());
    let mut placed: HashSet<&str> = HashSet::new();
    while ordered.len() < module.classes.len() {
        let before = ordered.len();
        for class in &module.classes {
            if placed.contains(class.name.as_str()) {
                continue;
            }
            let ready = match &class.super_name {
                None => true,
                Some(parent) => builtins::is_builtin(parent) || placed.contains(parent.as_str()),
            };
            if ready {
                placed.insert(&class.name);
                ordered.push(class);
            }
        }
        // The shape check rejected cycles and unknown parents, so every pass makes progress.
        if ordered.len() == before {
            break;
        }
    }
    ordered
}

fn builtin_class(id: ClassId, name: &str) -> LinkedClass {
    let initializer = LinkedMethod {
        name: "<init>".into(),
        descriptor: "()V".into(),
        signature: MethodDescriptor { params: Vec::new(), ret: None },
        access: AccessFlags::PUBLIC,
        code: VerifiedMethod {
            instructions: vec![Instruction::simple(RETURN)],
            handlers: Vec::new(),
            max_stack: 0,
            max_locals: 1,
        },
    };
    let methods = if name == builtins::BLOCKCHAIN { Vec::new() } else { vec![initializer] };
    LinkedClass { id, name: name.to_owned(), methods, pool: Vec::new() }
}

fn resolve_pool(
    class: &ClassFile,
    registry: &TypeRegistry,
    classes: &[LinkedClass],
) -> Result<Vec<PoolTarget>, LinkError> {
    let class_id = |index: u16| -> Result<ClassId, LinkError> {
        let name = class.pool.class_name(index).unwrap_or_default();
        registry.lookup(name).ok_or_else(|| LinkError::UnknownClass {
            class: class.name.clone(),
            name: name.to_owned(),
        })
    };

    let mut pool = vec![PoolTarget::Unused; class.pool.len() + 1];
    for (index, entry) in class.pool.iter() {
        pool[index as usize] = match entry {
            PoolEntry::Int(v) => PoolTarget::Int(*v),
            PoolEntry::Long(v) => PoolTarget::Long(*v),
            PoolEntry::Float(v) => PoolTarget::Float(*v),
            PoolEntry::Double(v) => PoolTarget::Double(*v),
            PoolEntry::Class(name) => match ElementKind::from_class_name(name) {
                Some(kind) => PoolTarget::Class(ClassTarget::Container(kind)),
                None => PoolTarget::Class(ClassTarget::Type(class_id(index)?)),
            },
            PoolEntry::Field(field) => {
                let owner = class_id(field.class)?;
                let unknown = || LinkError::UnknownField {
                    class: class.name.clone(),
                    owner: class.pool.class_name(field.class).unwrap_or_default().to_owned(),
                    name: field.name.clone(),
                };
                let layout = registry.layout(owner).ok_or_else(unknown)?;
                let instance = layout.field_index(owner, &field.name);
                let static_slot = registry.static_index(owner, &field.name);
                let declared = instance
                    .map(|i| layout.fields[i].kind)
                    .or_else(|| static_slot.map(|s| registry.statics()[s].kind))
                    .ok_or_else(unknown)?;
                let mismatch = || LinkError::FieldKindMismatch {
                    class: class.name.clone(),
                    name: field.name.clone(),
                    descriptor: field.descriptor.clone(),
                };
                let kind = FieldKind::parse(&field.descriptor).map_err(|_| mismatch())?;
                if kind != declared {
                    return Err(mismatch());
                }
                PoolTarget::Field(FieldTarget { owner, instance, static_slot, kind })
            }
            PoolEntry::Method(method) => {
                let unknown = |owner: String| LinkError::UnknownMethod {
                    class: class.name.clone(),
                    owner,
                    name: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                };
                let target = match method.owner {
                    MethodOwner::Contract(address) => MethodTarget::Contract {
                        address,
                        name: method.name.clone(),
                        descriptor: method.descriptor.clone(),
                    },
                    MethodOwner::Class(owner_index) => {
                        let owner_name = class.pool.class_name(owner_index).unwrap_or_default();
                        if owner_name == builtins::BLOCKCHAIN {
                            Native::lookup(&method.name, &method.descriptor)
                                .map(MethodTarget::Native)
                                .ok_or_else(|| unknown(owner_name.to_owned()))?
                        } else {
                            let owner = class_id(owner_index)?;
                            let layout = registry
                                .layout(owner)
                                .ok_or_else(|| unknown(owner_name.to_owned()))?;
                            let handle = layout
                                .chain
                                .iter()
                                .rev()
                                .find_map(|&ancestor| {
                                    let index = classes
                                        .get(ancestor.0 as usize)?
                                        .find_method(&method.name, &method.descriptor)?;
                                    Some(MethodHandle { class: ancestor, index })
                                })
                                .ok_or_else(|| unknown(owner_name.to_owned()))?;
                            MethodTarget::Class {
                                handle,
                                name: method.name.clone(),
                                descriptor: method.descriptor.clone(),
                            }
                        }
                    }
                };
                PoolTarget::Method(target)
            }
        };
    }
    debug!(target: "avm::unit", class = %class.name, entries = class.pool.len(), "Pool resolved");
    Ok(pool)
}

/// Checks that every instruction uses its pool entry the way the entry resolved.
fn check_uses(
    class: &ClassFile,
    method: &str,
    code: &[Instruction],
    pool: &[PoolTarget],
    classes: &[LinkedClass],
) -> Result<(), LinkError> {
    let is_static = |target: &MethodTarget| match target {
        MethodTarget::Class { handle, .. } => classes
            .get(handle.class.0 as usize)
            .and_then(|class| class.methods.get(handle.index))
            .is_some_and(LinkedMethod::is_static),
        MethodTarget::Native(_) | MethodTarget::Contract { .. } => true,
    };
    for (at, insn) in code.iter().enumerate() {
        let index = match insn.operand {
            Operand::Field(i) | Operand::Method(i) | Operand::Class(i) => i,
            _ => continue,
        };
        let entry = pool.get(index as usize).unwrap_or(&PoolTarget::Unused);
        let compatible = match (insn.opcode, entry) {
            (GETFIELD | PUTFIELD, PoolTarget::Field(field)) => field.instance.is_some(),
            (GETSTATIC | PUTSTATIC, PoolTarget::Field(field)) => field.static_slot.is_some(),
            (INVOKESTATIC, PoolTarget::Method(target)) => is_static(target),
            (INVOKEVIRTUAL | INVOKESPECIAL, PoolTarget::Method(target)) => !is_static(target),
            (NEW, PoolTarget::Class(ClassTarget::Type(_))) => true,
            (ANEWARRAY | CHECKCAST | INSTANCEOF, PoolTarget::Class(_)) => true,
            _ => false,
        };
        if !compatible {
            return Err(LinkError::IncompatibleUse {
                class: class.name.clone(),
                method: method.to_owned(),
                at,
                index,
            });
        }
    }
    Ok(())
}
