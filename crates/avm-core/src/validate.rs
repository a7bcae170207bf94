//! Static complexity validation of contract modules.
//!
//! Every method is checked independently against hard ceilings before anything executes:
//!
//! - code length in bytes,
//! - exception table entries,
//! - operand stack depth, computed by data-flow analysis over the decoded instructions,
//! - local variable slots, including the receiver and parameters.
//!
//! `long` and `double` values occupy two slots for both depth and local counting. A value exactly
//! at a ceiling is accepted; one past it is rejected. All validating parties must agree on this
//! boundary, so the analysis is deterministic and depends on the module bytes alone.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    builtins,
    bytecode::{self, opcode::*, ContainerCall, DecodeError, Instruction, Operand},
    constants::limits,
    module::{
        ClassFile, ContractModule, DescriptorError, FieldKind, FormatError, MethodDescriptor,
        MethodInfo, PoolEntry, ValueKind,
    },
    unit::LinkError,
    ConstantPool,
};

/// The ceilings enforced at deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Maximum code length of a method, in bytes.
    pub max_method_byte_length: usize,
    /// Maximum exception table entries of a method.
    pub max_exception_handlers: usize,
    /// Maximum operand stack depth of a method, in slots.
    pub max_operand_stack_depth: u16,
    /// Maximum local variable slots of a method.
    pub max_local_slots: u16,
    /// Maximum classes per module.
    pub max_classes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_method_byte_length: limits::MAX_METHOD_BYTE_LENGTH,
            max_exception_handlers: limits::MAX_EXCEPTION_TABLE_ENTRIES,
            max_operand_stack_depth: limits::MAX_OPERAND_STACK_DEPTH,
            max_local_slots: limits::MAX_LOCAL_SLOTS,
            max_classes: limits::MAX_CLASSES,
        }
    }
}

/// The rule a method broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeViolation {
    /// The code is longer than allowed.
    #[error("method byte length limit exceeded: length={length} > limit={limit}")]
    MethodTooLong {
        /// Code length in bytes.
        length: usize,
        /// The ceiling.
        limit: usize,
    },
    /// The exception table has too many entries.
    #[error("exception table limit exceeded: count={count} > limit={limit}")]
    TooManyExceptionHandlers {
        /// Number of entries.
        count: usize,
        /// The ceiling.
        limit: usize,
    },
    /// The operand stack grows deeper than allowed.
    #[error("operand stack depth limit exceeded: depth={depth} > limit={limit}")]
    OperandStackOverflow {
        /// The first depth found past the ceiling, in slots.
        depth: u16,
        /// The ceiling.
        limit: u16,
    },
    /// The method needs more local slots than allowed.
    #[error("local variable slot limit exceeded: slots={slots} > limit={limit}")]
    TooManyLocals {
        /// Slots needed.
        slots: u32,
        /// The ceiling.
        limit: u16,
    },
    /// The code does not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A descriptor does not parse.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// A concrete method has no code.
    #[error("empty code")]
    EmptyCode,
    /// An exception table entry does not align with instruction boundaries.
    #[error("invalid handler range: start_pc={start_pc} end_pc={end_pc} handler_pc={handler_pc}")]
    InvalidHandlerRange {
        /// First covered byte offset.
        start_pc: u16,
        /// End of the covered range.
        end_pc: u16,
        /// Handler byte offset.
        handler_pc: u16,
    },
    /// A pool index does not name an entry of the expected kind.
    #[error("invalid constant pool reference {index} at instruction {at}")]
    InvalidConstant {
        /// Instruction index.
        at: usize,
        /// Pool index.
        index: u16,
    },
    /// An instruction pops more than the stack holds.
    #[error("operand stack underflow at instruction {at}")]
    StackUnderflow {
        /// Instruction index.
        at: usize,
    },
    /// An instruction pops a value of the wrong kind.
    #[error("type mismatch at instruction {at}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Instruction index.
        at: usize,
        /// Kind the instruction needs.
        expected: ValueKind,
        /// Kind on the stack.
        found: ValueKind,
    },
    /// A slot-level stack instruction would split a two-slot value.
    #[error("stack instruction splits a two-slot value at instruction {at}")]
    SplitWideValue {
        /// Instruction index.
        at: usize,
    },
    /// Two paths reach an instruction with different stack shapes.
    #[error("inconsistent stack shape at instruction {at}")]
    StackShapeMismatch {
        /// Instruction index.
        at: usize,
    },
    /// A return instruction does not match the declared return type.
    #[error("return does not match descriptor at instruction {at}")]
    ReturnMismatch {
        /// Instruction index.
        at: usize,
    },
    /// Execution can run past the last instruction.
    #[error("control falls off the end of the code")]
    FallsOffEnd,
    /// An initializer has the wrong shape.
    #[error("invalid initializer declaration")]
    InvalidInitializer,
}

/// A method failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("method {class}.{method}{descriptor} rejected: {violation}")]
pub struct MethodRejection {
    /// Declaring class.
    pub class: String,
    /// Method name.
    pub method: String,
    /// Method descriptor.
    pub descriptor: String,
    /// The broken rule.
    pub violation: ShapeViolation,
}

/// Why a module was refused at deployment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StaticRejection {
    /// The module bytes do not decode.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A method broke a structural rule.
    #[error(transparent)]
    Method(#[from] MethodRejection),
    /// A reference does not resolve.
    #[error(transparent)]
    Linkage(#[from] LinkError),
    /// The module has no classes.
    #[error("module has no classes")]
    EmptyModule,
    /// The module has more classes than allowed.
    #[error("class count limit exceeded: count={count} > limit={limit}")]
    TooManyClasses {
        /// Number of classes.
        count: usize,
        /// The ceiling.
        limit: usize,
    },
    /// The main class is not in the module.
    #[error("main class {name} not found")]
    MissingMainClass {
        /// The declared main class.
        name: String,
    },
    /// Two classes share a name.
    #[error("duplicate class {name}")]
    DuplicateClass {
        /// The class name.
        name: String,
    },
    /// A class uses the runtime's reserved namespace.
    #[error("class name {name} is reserved")]
    ReservedClassName {
        /// The class name.
        name: String,
    },
    /// A superclass is neither in the module nor built in.
    #[error("class {class} extends unknown class {super_name}")]
    UnknownSuperclass {
        /// The subclass.
        class: String,
        /// The missing superclass.
        super_name: String,
    },
    /// A class is its own ancestor.
    #[error("class {class} has a cyclic hierarchy")]
    CyclicHierarchy {
        /// A class on the cycle.
        class: String,
    },
    /// A class declares the same member twice.
    #[error("class {class} declares {name} {descriptor} twice")]
    DuplicateMember {
        /// The class.
        class: String,
        /// Member name.
        name: String,
        /// Member descriptor.
        descriptor: String,
    },
}

/// An exception table entry resolved to instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    /// First covered instruction.
    pub start: usize,
    /// First instruction past the covered range.
    pub end: usize,
    /// First instruction of the handler.
    pub handler: usize,
    /// Pool index of the caught class, `0` catches everything.
    pub catch_type: u16,
}

impl HandlerRange {
    /// Whether the range covers instruction `at`.
    pub const fn covers(&self, at: usize) -> bool {
        self.start <= at && at < self.end
    }
}

/// A method that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMethod {
    /// Decoded instructions; empty for abstract methods.
    pub instructions: Vec<Instruction>,
    /// Resolved exception table.
    pub handlers: Vec<HandlerRange>,
    /// Computed operand stack depth, in slots.
    pub max_stack: u16,
    /// Computed local slots.
    pub max_locals: u16,
}

/// Checks the module-level rules: class count, naming, and a resolvable acyclic hierarchy.
pub fn validate_module_shape(
    module: &ContractModule,
    limits: &ValidationLimits,
) -> Result<(), StaticRejection> {
    if module.classes.is_empty() {
        return Err(StaticRejection::EmptyModule);
    }
    if module.classes.len() > limits.max_classes {
        return Err(StaticRejection::TooManyClasses {
            count: module.classes.len(),
            limit: limits.max_classes,
        });
    }
    if module.class(&module.main_class).is_none() {
        return Err(StaticRejection::MissingMainClass { name: module.main_class.clone() });
    }
    for (i, class) in module.classes.iter().enumerate() {
        if class.name.starts_with(builtins::RESERVED_PREFIX) || class.name.starts_with('[') {
            return Err(StaticRejection::ReservedClassName { name: class.name.clone() });
        }
        if module.classes[..i].iter().any(|other| other.name == class.name) {
            return Err(StaticRejection::DuplicateClass { name: class.name.clone() });
        }
        check_unique_members(class)?;
    }
    for class in &module.classes {
        // Walking up at most `classes.len()` module ancestors either reaches a built-in or
        // proves a cycle.
        let mut current = class;
        let mut steps = 0;
        while let Some(super_name) = &current.super_name {
            if builtins::is_builtin(super_name) {
                break;
            }
            current = module.class(super_name).ok_or_else(|| StaticRejection::UnknownSuperclass {
                class: current.name.clone(),
                super_name: super_name.clone(),
            })?;
            steps += 1;
            if steps > module.classes.len() {
                return Err(StaticRejection::CyclicHierarchy { class: class.name.clone() });
            }
        }
    }
    Ok(())
}

fn check_unique_members(class: &ClassFile) -> Result<(), StaticRejection> {
    let duplicate = |name: &str, descriptor: &str| StaticRejection::DuplicateMember {
        class: class.name.clone(),
        name: name.to_owned(),
        descriptor: descriptor.to_owned(),
    };
    for (i, field) in class.fields.iter().enumerate() {
        if class.fields[..i].iter().any(|other| other.name == field.name) {
            return Err(duplicate(&field.name, &field.descriptor));
        }
    }
    for (i, method) in class.methods.iter().enumerate() {
        if class.methods[..i]
            .iter()
            .any(|other| other.name == method.name && other.descriptor == method.descriptor)
        {
            return Err(duplicate(&method.name, &method.descriptor));
        }
    }
    Ok(())
}

/// Validates every method of a class, returning them in declaration order.
pub fn validate_class(
    class: &ClassFile,
    limits: &ValidationLimits,
) -> Result<Vec<VerifiedMethod>, MethodRejection> {
    class
        .methods
        .iter()
        .map(|method| {
            validate_method(class, method, limits).map_err(|violation| {
                warn!(
                    target: "avm::validate",
                    class = %class.name,
                    method = %method.name,
                    %violation,
                    "Method rejected"
                );
                MethodRejection {
                    class: class.name.clone(),
                    method: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                    violation,
                }
            })
        })
        .collect()
}

/// Validates one method against every ceiling and structural rule.
pub fn validate_method(
    class: &ClassFile,
    method: &MethodInfo,
    limits: &ValidationLimits,
) -> Result<VerifiedMethod, ShapeViolation> {
    let length = method.code.len();
    if length > limits.max_method_byte_length {
        return Err(ShapeViolation::MethodTooLong {
            length,
            limit: limits.max_method_byte_length,
        });
    }
    let count = method.handlers.len();
    if count > limits.max_exception_handlers {
        return Err(ShapeViolation::TooManyExceptionHandlers {
            count,
            limit: limits.max_exception_handlers,
        });
    }

    let descriptor = MethodDescriptor::parse(&method.descriptor)?;
    let is_static = method.is_static();
    match method.name.as_str() {
        "<init>" if is_static || descriptor.ret.is_some() => {
            return Err(ShapeViolation::InvalidInitializer)
        }
        "<clinit>" if !is_static || method.descriptor != "()V" => {
            return Err(ShapeViolation::InvalidInitializer)
        }
        _ => {}
    }
    let param_slots = descriptor.param_slots() as u32 + u32::from(!is_static);

    if method.access.contains(crate::AccessFlags::ABSTRACT) && method.code.is_empty() {
        check_locals(param_slots, limits)?;
        return Ok(VerifiedMethod {
            instructions: Vec::new(),
            handlers: Vec::new(),
            max_stack: 0,
            max_locals: param_slots as u16,
        });
    }
    if method.code.is_empty() {
        return Err(ShapeViolation::EmptyCode);
    }

    let decoded = bytecode::decode(&method.code)?;
    let handlers = method
        .handlers
        .iter()
        .map(|h| {
            let invalid = ShapeViolation::InvalidHandlerRange {
                start_pc: h.start_pc,
                end_pc: h.end_pc,
                handler_pc: h.handler_pc,
            };
            let start = decoded.index_of(h.start_pc as usize).ok_or_else(|| invalid.clone())?;
            let end = decoded.index_of(h.end_pc as usize).ok_or_else(|| invalid.clone())?;
            let handler = decoded
                .index_of(h.handler_pc as usize)
                .filter(|&i| i < decoded.instructions.len())
                .ok_or_else(|| invalid.clone())?;
            if start >= end {
                return Err(invalid);
            }
            if h.catch_type != 0 && class.pool.class_name(h.catch_type).is_none() {
                return Err(ShapeViolation::InvalidConstant { at: handler, index: h.catch_type });
            }
            Ok(HandlerRange { start, end, handler, catch_type: h.catch_type })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let max_locals = decoded
        .instructions
        .iter()
        .filter_map(Instruction::local_access)
        .map(|(index, width)| index as u32 + width as u32)
        .fold(param_slots, u32::max);
    check_locals(max_locals, limits)?;

    let max_stack = analyze_frames(
        &decoded.instructions,
        &handlers,
        &class.pool,
        descriptor.ret,
        limits.max_operand_stack_depth,
    )?;

    debug!(
        target: "avm::validate",
        class = %class.name,
        method = %method.name,
        max_stack,
        max_locals,
        "Method accepted"
    );
    Ok(VerifiedMethod {
        instructions: decoded.instructions,
        handlers,
        max_stack,
        max_locals: max_locals as u16,
    })
}

fn check_locals(slots: u32, limits: &ValidationLimits) -> Result<(), ShapeViolation> {
    if slots > limits.max_local_slots as u32 {
        return Err(ShapeViolation::TooManyLocals { slots, limit: limits.max_local_slots });
    }
    Ok(())
}

enum Flow {
    Next,
    Branch(usize),
    Jump(usize),
    Stop,
}

struct Shape<'a> {
    stack: &'a mut Vec<ValueKind>,
    at: usize,
}

impl Shape<'_> {
    fn push(&mut self, kind: ValueKind) {
        self.stack.push(kind);
    }

    fn pop(&mut self, expected: ValueKind) -> Result<(), ShapeViolation> {
        let found = self.stack.pop().ok_or(ShapeViolation::StackUnderflow { at: self.at })?;
        if found != expected {
            return Err(ShapeViolation::TypeMismatch { at: self.at, expected, found });
        }
        Ok(())
    }

    fn shuffle(&mut self, op: u8) -> Result<(), ShapeViolation> {
        let available: u16 = self.stack.iter().map(|kind| kind.slots()).sum();
        let needed = match op {
            POP | DUP => 1,
            POP2 | DUP2 | DUP_X1 | SWAP => 2,
            DUP_X2 | DUP2_X1 => 3,
            _ => 4,
        };
        if available < needed {
            return Err(ShapeViolation::StackUnderflow { at: self.at });
        }
        bytecode::shuffle(op, self.stack, |kind| kind.slots())
            .ok_or(ShapeViolation::SplitWideValue { at: self.at })
    }

    fn depth(&self) -> u16 {
        self.stack.iter().map(|kind| kind.slots()).sum()
    }
}

/// Computes the maximum operand stack depth of a method by abstract interpretation, failing as
/// soon as any reachable state exceeds `limit`.
///
/// Runs over decoded instructions before rewriting and again over rewritten instructions, whose
/// container calls have the same stack effect as the array instructions they replace.
pub(crate) fn analyze_frames(
    code: &[Instruction],
    handlers: &[HandlerRange],
    pool: &ConstantPool,
    ret: Option<FieldKind>,
    limit: u16,
) -> Result<u16, ShapeViolation> {
    let mut entry: Vec<Option<Vec<ValueKind>>> = vec![None; code.len()];
    let mut worklist = vec![0];
    entry[0] = Some(Vec::new());
    let mut max = 0;

    let mut merge = |entry: &mut Vec<Option<Vec<ValueKind>>>,
                     worklist: &mut Vec<usize>,
                     target: usize,
                     state: &[ValueKind]| {
        match &entry[target] {
            Some(existing) if existing != state => {
                Err(ShapeViolation::StackShapeMismatch { at: target })
            }
            Some(_) => Ok(()),
            None => {
                entry[target] = Some(state.to_vec());
                worklist.push(target);
                Ok(())
            }
        }
    };

    while let Some(at) = worklist.pop() {
        let mut stack = entry[at].clone().unwrap_or_default();
        for handler in handlers.iter().filter(|h| h.covers(at)) {
            merge(&mut entry, &mut worklist, handler.handler, &[ValueKind::Reference])?;
        }

        let mut shape = Shape { stack: &mut stack, at };
        let flow = step(&code[at], &mut shape, pool, ret)?;
        let depth = shape.depth();
        if depth > limit {
            return Err(ShapeViolation::OperandStackOverflow { depth, limit });
        }
        max = max.max(depth);

        let next = at + 1;
        let successors = match flow {
            Flow::Next => [Some(next), None],
            Flow::Branch(target) => [Some(target), Some(next)],
            Flow::Jump(target) => [Some(target), None],
            Flow::Stop => [None, None],
        };
        for target in successors.into_iter().flatten() {
            if target >= code.len() {
                return Err(ShapeViolation::FallsOffEnd);
            }
            merge(&mut entry, &mut worklist, target, &stack)?;
        }
    }
    if !handlers.is_empty() {
        max = max.max(ValueKind::Reference.slots());
    }
    Ok(max)
}

const fn load_kind(op: u8) -> ValueKind {
    match op - ILOAD {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        3 => ValueKind::Double,
        _ => ValueKind::Reference,
    }
}

const fn arith_kind(offset: u8) -> ValueKind {
    match offset % 4 {
        0 => ValueKind::Int,
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        _ => ValueKind::Double,
    }
}

/// Element category of the array instruction `IALOAD + offset` (or `IASTORE + offset`).
const fn array_kind(offset: u8) -> ValueKind {
    match offset {
        1 => ValueKind::Long,
        2 => ValueKind::Float,
        3 => ValueKind::Double,
        4 => ValueKind::Reference,
        _ => ValueKind::Int,
    }
}

const fn conversion(op: u8) -> (ValueKind, ValueKind) {
    use ValueKind::*;
    match op {
        I2L => (Int, Long),
        I2F => (Int, Float),
        I2D => (Int, Double),
        L2I => (Long, Int),
        L2F => (Long, Float),
        L2D => (Long, Double),
        F2I => (Float, Int),
        F2L => (Float, Long),
        F2D => (Float, Double),
        D2I => (Double, Int),
        D2L => (Double, Long),
        D2F => (Double, Float),
        _ => (Int, Int),
    }
}

const fn return_kind(op: u8) -> Option<ValueKind> {
    match op {
        IRETURN => Some(ValueKind::Int),
        LRETURN => Some(ValueKind::Long),
        FRETURN => Some(ValueKind::Float),
        DRETURN => Some(ValueKind::Double),
        ARETURN => Some(ValueKind::Reference),
        _ => None,
    }
}

fn step(
    insn: &Instruction,
    shape: &mut Shape<'_>,
    pool: &ConstantPool,
    ret: Option<FieldKind>,
) -> Result<Flow, ShapeViolation> {
    use ValueKind::*;

    let at = shape.at;
    let op = insn.opcode;
    let pool_index = || match insn.operand {
        Operand::Constant(i) | Operand::Field(i) | Operand::Method(i) | Operand::Class(i) => i,
        _ => 0,
    };
    let invalid = |index| ShapeViolation::InvalidConstant { at, index };
    let branch_target = || match insn.operand {
        Operand::Branch(target) => target,
        _ => usize::MAX,
    };

    match op {
        NOP | IINC => {}
        ACONST_NULL => shape.push(Reference),
        ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => shape.push(Int),
        LCONST_0 | LCONST_1 => shape.push(Long),
        FCONST_0..=FCONST_2 => shape.push(Float),
        DCONST_0 | DCONST_1 => shape.push(Double),
        LDC | LDC2_W => {
            let index = pool_index();
            let kind = match (op, pool.get(index)) {
                (LDC, Some(PoolEntry::Int(_))) => Int,
                (LDC, Some(PoolEntry::Float(_))) => Float,
                (LDC2_W, Some(PoolEntry::Long(_))) => Long,
                (LDC2_W, Some(PoolEntry::Double(_))) => Double,
                _ => return Err(invalid(index)),
            };
            shape.push(kind);
        }
        ILOAD..=ALOAD => shape.push(load_kind(op)),
        ISTORE..=ASTORE => shape.pop(load_kind(op - ISTORE + ILOAD))?,
        IALOAD..=SALOAD => {
            shape.pop(Int)?;
            shape.pop(Reference)?;
            shape.push(array_kind(op - IALOAD));
        }
        IASTORE..=SASTORE => {
            shape.pop(array_kind(op - IASTORE))?;
            shape.pop(Int)?;
            shape.pop(Reference)?;
        }
        POP..=SWAP => shape.shuffle(op)?,
        IADD..=DREM => {
            let kind = arith_kind(op - IADD);
            shape.pop(kind)?;
            shape.pop(kind)?;
            shape.push(kind);
        }
        INEG..=DNEG => {
            let kind = arith_kind(op - INEG);
            shape.pop(kind)?;
            shape.push(kind);
        }
        ISHL..=LUSHR => {
            let kind = if (op - ISHL) % 2 == 0 { Int } else { Long };
            shape.pop(Int)?;
            shape.pop(kind)?;
            shape.push(kind);
        }
        IAND..=LXOR => {
            let kind = if (op - IAND) % 2 == 0 { Int } else { Long };
            shape.pop(kind)?;
            shape.pop(kind)?;
            shape.push(kind);
        }
        I2L..=I2S => {
            let (from, to) = conversion(op);
            shape.pop(from)?;
            shape.push(to);
        }
        LCMP | FCMPL..=DCMPG => {
            let kind = match op {
                LCMP => Long,
                FCMPL | FCMPG => Float,
                _ => Double,
            };
            shape.pop(kind)?;
            shape.pop(kind)?;
            shape.push(Int);
        }
        IFEQ..=IFLE => {
            shape.pop(Int)?;
            return Ok(Flow::Branch(branch_target()));
        }
        IF_ICMPEQ..=IF_ICMPLE => {
            shape.pop(Int)?;
            shape.pop(Int)?;
            return Ok(Flow::Branch(branch_target()));
        }
        IF_ACMPEQ | IF_ACMPNE => {
            shape.pop(Reference)?;
            shape.pop(Reference)?;
            return Ok(Flow::Branch(branch_target()));
        }
        IFNULL | IFNONNULL => {
            shape.pop(Reference)?;
            return Ok(Flow::Branch(branch_target()));
        }
        GOTO => return Ok(Flow::Jump(branch_target())),
        IRETURN..=RETURN => {
            let returned = return_kind(op);
            if returned != ret.map(FieldKind::value_kind) {
                return Err(ShapeViolation::ReturnMismatch { at });
            }
            if let Some(kind) = returned {
                shape.pop(kind)?;
            }
            return Ok(Flow::Stop);
        }
        GETSTATIC..=PUTFIELD => {
            let index = pool_index();
            let field = pool.field_ref(index).ok_or_else(|| invalid(index))?;
            let kind = FieldKind::parse(&field.descriptor)?.value_kind();
            match op {
                GETSTATIC => shape.push(kind),
                PUTSTATIC => shape.pop(kind)?,
                GETFIELD => {
                    shape.pop(Reference)?;
                    shape.push(kind);
                }
                _ => {
                    shape.pop(kind)?;
                    shape.pop(Reference)?;
                }
            }
        }
        INVOKEVIRTUAL..=INVOKESTATIC => match insn.operand {
            Operand::Container(call) => match call {
                ContainerCall::Get(kind) => {
                    shape.pop(Int)?;
                    shape.pop(Reference)?;
                    shape.push(kind.value_kind());
                }
                ContainerCall::Set(kind) => {
                    shape.pop(kind.value_kind())?;
                    shape.pop(Int)?;
                    shape.pop(Reference)?;
                }
                ContainerCall::Length => {
                    shape.pop(Reference)?;
                    shape.push(Int);
                }
                ContainerCall::Allocate(_) => {
                    shape.pop(Int)?;
                    shape.push(Reference);
                }
            },
            _ => {
                let index = pool_index();
                let method = pool.method_ref(index).ok_or_else(|| invalid(index))?;
                let descriptor = MethodDescriptor::parse(&method.descriptor)?;
                for param in descriptor.params.iter().rev() {
                    shape.pop(param.value_kind())?;
                }
                if op != INVOKESTATIC {
                    shape.pop(Reference)?;
                }
                if let Some(kind) = descriptor.ret {
                    shape.push(kind.value_kind());
                }
            }
        },
        NEW => {
            let index = pool_index();
            pool.class_name(index).ok_or_else(|| invalid(index))?;
            shape.push(Reference);
        }
        NEWARRAY => {
            shape.pop(Int)?;
            shape.push(Reference);
        }
        ANEWARRAY => {
            let index = pool_index();
            pool.class_name(index).ok_or_else(|| invalid(index))?;
            shape.pop(Int)?;
            shape.push(Reference);
        }
        ARRAYLENGTH => {
            shape.pop(Reference)?;
            shape.push(Int);
        }
        ATHROW => {
            shape.pop(Reference)?;
            return Ok(Flow::Stop);
        }
        CHECKCAST | INSTANCEOF => {
            let index = pool_index();
            pool.class_name(index).ok_or_else(|| invalid(index))?;
            shape.pop(Reference)?;
            shape.push(if op == CHECKCAST { Reference } else { Int });
        }
        MONITORENTER | MONITOREXIT => shape.pop(Reference)?,
        _ => {
            return Err(DecodeError::UnsupportedOpcode { pc: at, opcode: op }.into());
        }
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessFlags, ClassFile, ExceptionHandler, MethodInfo};
    use alloy_primitives::Bytes;

    fn class_with(method: MethodInfo) -> ClassFile {
        ClassFile {
            name: "Main".into(),
            super_name: None,
            access: AccessFlags::PUBLIC,
            pool: ConstantPool::new(),
            fields: vec![],
            methods: vec![method],
        }
    }

    fn static_method(descriptor: &str, code: Vec<u8>) -> MethodInfo {
        MethodInfo {
            access: AccessFlags::STATIC,
            name: "run".into(),
            descriptor: descriptor.into(),
            code: Bytes::from(code),
            handlers: vec![],
        }
    }

    fn check(method: MethodInfo) -> Result<VerifiedMethod, ShapeViolation> {
        let class = class_with(method);
        validate_method(&class, &class.methods[0], &ValidationLimits::default())
    }

    #[test]
    fn test_simple_method_shape() {
        let verified =
            check(static_method("(JI)J", vec![LLOAD_0, ILOAD_2, I2L, LADD, LRETURN])).unwrap();
        assert_eq!(verified.max_stack, 4);
        assert_eq!(verified.max_locals, 3);
    }

    #[test]
    fn test_falls_off_end() {
        assert_eq!(check(static_method("()V", vec![NOP])), Err(ShapeViolation::FallsOffEnd));
    }

    #[test]
    fn test_underflow_and_type_mismatch() {
        assert_eq!(
            check(static_method("()V", vec![POP, RETURN])),
            Err(ShapeViolation::StackUnderflow { at: 0 })
        );
        assert_eq!(
            check(static_method("()V", vec![LCONST_0, ICONST_0, IADD, POP, RETURN])),
            Err(ShapeViolation::TypeMismatch {
                at: 2,
                expected: ValueKind::Int,
                found: ValueKind::Long
            })
        );
        assert_eq!(
            check(static_method("()V", vec![LCONST_0, POP, RETURN])),
            Err(ShapeViolation::SplitWideValue { at: 1 })
        );
    }

    #[test]
    fn test_return_must_match_descriptor() {
        assert_eq!(
            check(static_method("()I", vec![RETURN])),
            Err(ShapeViolation::ReturnMismatch { at: 0 })
        );
    }

    #[test]
    fn test_inconsistent_merge() {
        // if (x) push 1; join -> stack differs between the two paths
        let code = vec![ILOAD_0, IFEQ, 0x00, 0x04, ICONST_1, RETURN];
        assert_eq!(
            check(static_method("(I)V", code)),
            Err(ShapeViolation::StackShapeMismatch { at: 3 })
        );
    }

    #[test]
    fn test_handler_ranges_must_align() {
        let mut method = static_method("()V", vec![ICONST_0, POP, RETURN]);
        method.handlers =
            vec![ExceptionHandler { start_pc: 0, end_pc: 5, handler_pc: 2, catch_type: 0 }];
        assert!(matches!(check(method), Err(ShapeViolation::InvalidHandlerRange { .. })));
    }

    #[test]
    fn test_handler_entry_counts_toward_depth() {
        let mut method = static_method("()V", vec![NOP, RETURN, POP, RETURN]);
        method.handlers =
            vec![ExceptionHandler { start_pc: 0, end_pc: 1, handler_pc: 2, catch_type: 0 }];
        assert_eq!(check(method).unwrap().max_stack, 1);
    }

    #[test]
    fn test_initializer_shape() {
        let mut method = static_method("()V", vec![RETURN]);
        method.name = "<init>".into();
        assert_eq!(check(method), Err(ShapeViolation::InvalidInitializer));
    }
}
