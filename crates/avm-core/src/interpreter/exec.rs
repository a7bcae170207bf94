//! Semantics of single instructions.

use alloy_primitives::Address;

use super::{frame::Frame, InvocationFailure};
use crate::{
    builtins,
    bytecode::{opcode::*, shuffle, ContainerCall, Instruction, Operand},
    persistence::{Heap, HeapObject, ObjectBody, PersistenceError},
    storage::{StorageOverlay, WorldState},
    unit::{ClassTarget, CodeUnit, LinkedClass, MethodHandle, MethodTarget, Native, PoolTarget},
    CapabilityViolation, ClassId, ElementKind, EnergyCharge, EnergyLedger, InstanceId,
    MethodDescriptor, ResourceExhaustion, TypedContainer, Value,
};

/// What the interpreter loop does after an instruction.
#[derive(Debug)]
pub(crate) enum Step {
    /// Continue with the next instruction.
    Next,
    /// Continue at an instruction index.
    Jump(usize),
    /// Push a frame for a method of the same unit.
    Invoke { method: MethodHandle, args: Vec<Value> },
    /// Pop the current frame.
    Return(Option<Value>),
    /// Call another contract's entry point.
    Call { address: Address, name: String, descriptor: String, args: Vec<Value> },
    /// Schedule the running contract for destruction.
    SelfDestruct,
}

/// An instruction did not complete.
#[derive(Debug)]
pub(crate) enum Fault {
    /// A capability check failed; thrown as a built-in exception.
    Violation(CapabilityViolation),
    /// An exception object was thrown.
    Throw(InstanceId),
    /// The activation cannot continue.
    Abort(InvocationFailure),
}

impl From<CapabilityViolation> for Fault {
    fn from(violation: CapabilityViolation) -> Self {
        Self::Violation(violation)
    }
}

impl From<InvocationFailure> for Fault {
    fn from(failure: InvocationFailure) -> Self {
        Self::Abort(failure)
    }
}

impl From<ResourceExhaustion> for Fault {
    fn from(exhaustion: ResourceExhaustion) -> Self {
        Self::Abort(exhaustion.into())
    }
}

impl From<PersistenceError> for Fault {
    fn from(error: PersistenceError) -> Self {
        Self::Abort(error.into())
    }
}

/// Everything an instruction may touch besides its own frame.
pub(crate) struct Env<'a, S> {
    pub(crate) unit: &'a CodeUnit,
    pub(crate) class: &'a LinkedClass,
    pub(crate) heap: &'a mut Heap,
    pub(crate) overlay: &'a mut StorageOverlay<S>,
    pub(crate) ledger: &'a mut EnergyLedger,
}

pub(crate) fn class_name(unit: &CodeUnit, class: ClassId) -> String {
    unit.registry().layout(class).map(|layout| layout.name.clone()).unwrap_or_default()
}

fn cast_error(expected: impl Into<String>, found: impl Into<String>) -> CapabilityViolation {
    CapabilityViolation::ClassCast { expected: expected.into(), found: found.into() }
}

impl<S: WorldState> Env<'_, S> {
    /// Loads a referenced object, throwing on null.
    fn load(&mut self, reference: Option<InstanceId>) -> Result<&mut HeapObject, Fault> {
        let id = reference.ok_or(CapabilityViolation::NullReference)?;
        Ok(self.heap.load(id, self.overlay, self.ledger)?)
    }

    /// The class of a referenced instance, throwing on null or on a container.
    fn instance_class(&mut self, reference: Option<InstanceId>) -> Result<ClassId, Fault> {
        match &self.load(reference)?.body {
            ObjectBody::Instance { class, .. } => Ok(*class),
            ObjectBody::Container(container) => {
                Err(cast_error(builtins::OBJECT, container.kind().to_string()).into())
            }
        }
    }

    fn instance_fields(
        &mut self,
        reference: Option<InstanceId>,
        owner: ClassId,
    ) -> Result<&mut Vec<Value>, Fault> {
        let id = reference.ok_or(CapabilityViolation::NullReference)?;
        let object = self.heap.load(id, self.overlay, self.ledger)?;
        let found = match &mut object.body {
            ObjectBody::Instance { class, fields }
                if self.unit.registry().is_subtype(*class, owner) =>
            {
                return Ok(fields)
            }
            ObjectBody::Instance { class, .. } => class_name(self.unit, *class),
            ObjectBody::Container(container) => container.kind().to_string(),
        };
        Err(cast_error(class_name(self.unit, owner), found).into())
    }

    fn container(
        &mut self,
        reference: Option<InstanceId>,
        kind: Option<ElementKind>,
    ) -> Result<&mut TypedContainer, Fault> {
        let id = reference.ok_or(CapabilityViolation::NullReference)?;
        let object = self.heap.load(id, self.overlay, self.ledger)?;
        let found = match &mut object.body {
            ObjectBody::Container(container) => {
                if kind.is_none_or(|kind| container.kind() == kind) {
                    return Ok(container);
                }
                container.kind().to_string()
            }
            ObjectBody::Instance { class, .. } => class_name(self.unit, *class),
        };
        let expected = kind.map_or_else(|| "container".to_owned(), |kind| kind.to_string());
        Err(cast_error(expected, found).into())
    }

    /// Allocates a zeroed instance, billing one element per field.
    pub(crate) fn new_instance(&mut self, class: ClassId) -> Result<InstanceId, Fault> {
        let layout = self
            .unit
            .registry()
            .layout(class)
            .ok_or(InvocationFailure::OperandMismatch { at: 0 })?;
        self.ledger.charge(EnergyCharge::Allocation { elements: layout.field_count() as u64 })?;
        let fields = layout.default_fields();
        Ok(self.heap.allocate(ObjectBody::Instance { class, fields }))
    }

    /// Allocates an instance of a built-in exception class.
    pub(crate) fn new_exception(&mut self, name: &str) -> Result<InstanceId, Fault> {
        let class = self
            .unit
            .registry()
            .lookup(name)
            .ok_or(InvocationFailure::OperandMismatch { at: 0 })?;
        self.new_instance(class)
    }

    fn new_container(&mut self, kind: ElementKind, length: i32) -> Result<InstanceId, Fault> {
        self.ledger.charge(EnergyCharge::Allocation { elements: length.max(0) as u64 })?;
        let container = TypedContainer::new(kind, length)?;
        Ok(self.heap.allocate(ObjectBody::Container(container)))
    }

    fn is_instance(&mut self, id: InstanceId, target: ClassTarget) -> Result<bool, Fault> {
        let registry = self.unit.registry();
        Ok(match (&self.heap.load(id, self.overlay, self.ledger)?.body, target) {
            (ObjectBody::Instance { class, .. }, ClassTarget::Type(ty)) => {
                registry.is_subtype(*class, ty)
            }
            (ObjectBody::Container(container), ClassTarget::Container(kind)) => {
                container.kind() == kind
            }
            (ObjectBody::Container(_), ClassTarget::Type(ty)) => ty == ClassId::OBJECT,
            (ObjectBody::Instance { .. }, ClassTarget::Container(_)) => false,
        })
    }

    fn target_name(&self, target: ClassTarget) -> String {
        match target {
            ClassTarget::Type(ty) => class_name(self.unit, ty),
            ClassTarget::Container(kind) => kind.to_string(),
        }
    }
}

fn branch(frame: &Frame, insn: Instruction, taken: bool) -> Result<Step, Fault> {
    match insn.operand {
        Operand::Branch(target) if taken => Ok(Step::Jump(target)),
        Operand::Branch(_) => Ok(Step::Next),
        _ => Err(InvocationFailure::OperandMismatch { at: frame.pc }.into()),
    }
}

fn compare_floats(ordering: Option<core::cmp::Ordering>, nan: i32) -> i32 {
    ordering.map_or(nan, |ordering| ordering as i32)
}

fn container_op<S: WorldState>(
    env: &mut Env<'_, S>,
    frame: &mut Frame,
    call: ContainerCall,
) -> Result<Step, Fault> {
    match call {
        ContainerCall::Get(kind) => {
            let index = frame.pop_int()?;
            let reference = frame.pop_ref()?;
            env.ledger.charge(EnergyCharge::ContainerAccess)?;
            let value = env.container(reference, Some(kind))?.get(index)?;
            frame.push(value);
        }
        ContainerCall::Set(kind) => {
            let value = frame.pop()?;
            let index = frame.pop_int()?;
            let reference = frame.pop_ref()?;
            env.ledger.charge(EnergyCharge::ContainerAccess)?;
            env.container(reference, Some(kind))?.set(index, value)?;
        }
        ContainerCall::Length => {
            let reference = frame.pop_ref()?;
            env.ledger.charge(EnergyCharge::ContainerAccess)?;
            let length = env.container(reference, None)?.length();
            frame.push(Value::Int(length));
        }
        ContainerCall::Allocate(kind) => {
            let length = frame.pop_int()?;
            let id = env.new_container(kind, length)?;
            frame.push(Value::Ref(Some(id)));
        }
    }
    Ok(Step::Next)
}

fn invoke<S: WorldState>(
    env: &mut Env<'_, S>,
    frame: &mut Frame,
    opcode: u8,
    target: MethodTarget,
) -> Result<Step, Fault> {
    let unit = env.unit;
    let mismatch = InvocationFailure::OperandMismatch { at: frame.pc };
    match target {
        MethodTarget::Native(native) => {
            env.ledger.charge(EnergyCharge::Native)?;
            match native {
                Native::Revert => Err(InvocationFailure::Reverted.into()),
                Native::RemainingEnergy => {
                    frame.push(Value::Long(env.ledger.remaining() as i64));
                    Ok(Step::Next)
                }
                Native::SelfDestruct => Ok(Step::SelfDestruct),
            }
        }
        MethodTarget::Contract { address, name, descriptor } => {
            env.ledger.charge(EnergyCharge::Invoke)?;
            let params = MethodDescriptor::parse(&descriptor).map_err(|_| mismatch.clone())?;
            let args = frame.pop_n(params.params.len())?;
            Ok(Step::Call { address, name, descriptor, args })
        }
        MethodTarget::Class { handle, name, descriptor } => {
            env.ledger.charge(EnergyCharge::Invoke)?;
            let declared = unit.method(handle).ok_or(mismatch)?;
            let receiver = usize::from(opcode != INVOKESTATIC);
            let args = frame.pop_n(declared.signature.params.len() + receiver)?;
            if opcode == INVOKESTATIC {
                return Ok(Step::Invoke { method: handle, args });
            }
            let reference = args[0].as_reference().flatten();
            let class = env.instance_class(reference)?;
            if !unit.registry().is_subtype(class, handle.class) {
                let expected = class_name(unit, handle.class);
                return Err(cast_error(expected, class_name(unit, class)).into());
            }
            let method = match opcode {
                INVOKEVIRTUAL => unit.resolve(class, &name, &descriptor).unwrap_or(handle),
                _ => handle,
            };
            Ok(Step::Invoke { method, args })
        }
    }
}

/// Executes one instruction against `frame`.
pub(crate) fn step<S: WorldState>(
    env: &mut Env<'_, S>,
    frame: &mut Frame,
    insn: Instruction,
) -> Result<Step, Fault> {
    let (unit, class) = (env.unit, env.class);
    let at = frame.pc;
    let mismatch = || Fault::Abort(InvocationFailure::OperandMismatch { at });
    let op = insn.opcode;

    match op {
        NOP => {}
        ACONST_NULL => frame.push(Value::NULL),
        ICONST_M1..=ICONST_5 => frame.push(Value::Int(op as i32 - ICONST_0 as i32)),
        LCONST_0 | LCONST_1 => frame.push(Value::Long((op - LCONST_0) as i64)),
        FCONST_0..=FCONST_2 => frame.push(Value::Float((op - FCONST_0) as f32)),
        DCONST_0 | DCONST_1 => frame.push(Value::Double((op - DCONST_0) as f64)),
        BIPUSH | SIPUSH => match insn.operand {
            Operand::Int(v) => frame.push(Value::Int(v)),
            _ => return Err(mismatch()),
        },
        LDC | LDC2_W => {
            let Operand::Constant(index) = insn.operand else { return Err(mismatch()) };
            let value = match class.pool_entry(index) {
                PoolTarget::Int(v) => Value::Int(*v),
                PoolTarget::Long(v) => Value::Long(*v),
                PoolTarget::Float(v) => Value::Float(*v),
                PoolTarget::Double(v) => Value::Double(*v),
                _ => return Err(mismatch()),
            };
            frame.push(value);
        }

        ILOAD..=ALOAD => {
            let Operand::Local(index) = insn.operand else { return Err(mismatch()) };
            let value = frame.local(index)?;
            frame.push(value);
        }
        ISTORE..=ASTORE => {
            let Operand::Local(index) = insn.operand else { return Err(mismatch()) };
            let value = frame.pop()?;
            frame.set_local(index, value)?;
        }
        IINC => {
            let Operand::Iinc { index, delta } = insn.operand else { return Err(mismatch()) };
            let value = frame.local(index)?.as_int().ok_or_else(mismatch)?;
            frame.set_local(index, Value::Int(value.wrapping_add(delta as i32)))?;
        }

        AALOAD => return container_op(env, frame, ContainerCall::Get(ElementKind::Object)),
        AASTORE => return container_op(env, frame, ContainerCall::Set(ElementKind::Object)),

        POP..=SWAP => shuffle(op, &mut frame.stack, Value::slots).ok_or_else(mismatch)?,

        IADD | ISUB | IMUL | IAND | IOR | IXOR | ISHL | ISHR | IUSHR => {
            let b = frame.pop_int()?;
            let a = frame.pop_int()?;
            frame.push(Value::Int(match op {
                IADD => a.wrapping_add(b),
                ISUB => a.wrapping_sub(b),
                IMUL => a.wrapping_mul(b),
                IAND => a & b,
                IOR => a | b,
                IXOR => a ^ b,
                ISHL => a.wrapping_shl(b as u32 & 31),
                ISHR => a.wrapping_shr(b as u32 & 31),
                _ => ((a as u32) >> (b as u32 & 31)) as i32,
            }));
        }
        IDIV | IREM => {
            let b = frame.pop_int()?;
            let a = frame.pop_int()?;
            if b == 0 {
                return Err(CapabilityViolation::DivideByZero.into());
            }
            let result = if op == IDIV { a.wrapping_div(b) } else { a.wrapping_rem(b) };
            frame.push(Value::Int(result));
        }
        LADD | LSUB | LMUL | LAND | LOR | LXOR => {
            let b = frame.pop_long()?;
            let a = frame.pop_long()?;
            frame.push(Value::Long(match op {
                LADD => a.wrapping_add(b),
                LSUB => a.wrapping_sub(b),
                LMUL => a.wrapping_mul(b),
                LAND => a & b,
                LOR => a | b,
                _ => a ^ b,
            }));
        }
        LSHL | LSHR | LUSHR => {
            let shift = frame.pop_int()? as u32 & 63;
            let a = frame.pop_long()?;
            frame.push(Value::Long(match op {
                LSHL => a.wrapping_shl(shift),
                LSHR => a.wrapping_shr(shift),
                _ => ((a as u64) >> shift) as i64,
            }));
        }
        LDIV | LREM => {
            let b = frame.pop_long()?;
            let a = frame.pop_long()?;
            if b == 0 {
                return Err(CapabilityViolation::DivideByZero.into());
            }
            let result = if op == LDIV { a.wrapping_div(b) } else { a.wrapping_rem(b) };
            frame.push(Value::Long(result));
        }
        FADD | FSUB | FMUL | FDIV | FREM => {
            let b = frame.pop_float()?;
            let a = frame.pop_float()?;
            frame.push(Value::Float(match op {
                FADD => a + b,
                FSUB => a - b,
                FMUL => a * b,
                FDIV => a / b,
                _ => a % b,
            }));
        }
        DADD | DSUB | DMUL | DDIV | DREM => {
            let b = frame.pop_double()?;
            let a = frame.pop_double()?;
            frame.push(Value::Double(match op {
                DADD => a + b,
                DSUB => a - b,
                DMUL => a * b,
                DDIV => a / b,
                _ => a % b,
            }));
        }
        INEG => {
            let a = frame.pop_int()?;
            frame.push(Value::Int(a.wrapping_neg()));
        }
        LNEG => {
            let a = frame.pop_long()?;
            frame.push(Value::Long(a.wrapping_neg()));
        }
        FNEG => {
            let a = frame.pop_float()?;
            frame.push(Value::Float(-a));
        }
        DNEG => {
            let a = frame.pop_double()?;
            frame.push(Value::Double(-a));
        }

        // Float-to-integer casts saturate and map NaN to zero.
        I2L | I2F | I2D | I2B | I2C | I2S => {
            let a = frame.pop_int()?;
            frame.push(match op {
                I2L => Value::Long(a as i64),
                I2F => Value::Float(a as f32),
                I2D => Value::Double(a as f64),
                I2B => Value::Int(a as i8 as i32),
                I2C => Value::Int(a as u16 as i32),
                _ => Value::Int(a as i16 as i32),
            });
        }
        L2I | L2F | L2D => {
            let a = frame.pop_long()?;
            frame.push(match op {
                L2I => Value::Int(a as i32),
                L2F => Value::Float(a as f32),
                _ => Value::Double(a as f64),
            });
        }
        F2I | F2L | F2D => {
            let a = frame.pop_float()?;
            frame.push(match op {
                F2I => Value::Int(a as i32),
                F2L => Value::Long(a as i64),
                _ => Value::Double(a as f64),
            });
        }
        D2I | D2L | D2F => {
            let a = frame.pop_double()?;
            frame.push(match op {
                D2I => Value::Int(a as i32),
                D2L => Value::Long(a as i64),
                _ => Value::Float(a as f32),
            });
        }

        LCMP => {
            let b = frame.pop_long()?;
            let a = frame.pop_long()?;
            frame.push(Value::Int(a.cmp(&b) as i32));
        }
        FCMPL | FCMPG => {
            let b = frame.pop_float()?;
            let a = frame.pop_float()?;
            let nan = if op == FCMPL { -1 } else { 1 };
            frame.push(Value::Int(compare_floats(a.partial_cmp(&b), nan)));
        }
        DCMPL | DCMPG => {
            let b = frame.pop_double()?;
            let a = frame.pop_double()?;
            let nan = if op == DCMPL { -1 } else { 1 };
            frame.push(Value::Int(compare_floats(a.partial_cmp(&b), nan)));
        }

        IFEQ..=IFLE => {
            let a = frame.pop_int()?;
            let taken = match op {
                IFEQ => a == 0,
                IFNE => a != 0,
                IFLT => a < 0,
                IFGE => a >= 0,
                IFGT => a > 0,
                _ => a <= 0,
            };
            return branch(frame, insn, taken);
        }
        IF_ICMPEQ..=IF_ICMPLE => {
            let b = frame.pop_int()?;
            let a = frame.pop_int()?;
            let taken = match op {
                IF_ICMPEQ => a == b,
                IF_ICMPNE => a != b,
                IF_ICMPLT => a < b,
                IF_ICMPGE => a >= b,
                IF_ICMPGT => a > b,
                _ => a <= b,
            };
            return branch(frame, insn, taken);
        }
        IF_ACMPEQ | IF_ACMPNE => {
            let b = frame.pop_ref()?;
            let a = frame.pop_ref()?;
            return branch(frame, insn, (a == b) == (op == IF_ACMPEQ));
        }
        IFNULL | IFNONNULL => {
            let a = frame.pop_ref()?;
            return branch(frame, insn, a.is_none() == (op == IFNULL));
        }
        GOTO => return branch(frame, insn, true),

        IRETURN..=ARETURN => return Ok(Step::Return(Some(frame.pop()?))),
        RETURN => return Ok(Step::Return(None)),

        GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
            let Operand::Field(index) = insn.operand else { return Err(mismatch()) };
            let PoolTarget::Field(field) = *class.pool_entry(index) else {
                return Err(mismatch());
            };
            match op {
                GETSTATIC => {
                    let slot = field.static_slot.ok_or_else(mismatch)?;
                    let value = env.heap.static_value(slot).ok_or_else(mismatch)?;
                    frame.push(value);
                }
                PUTSTATIC => {
                    let slot = field.static_slot.ok_or_else(mismatch)?;
                    let value = frame.pop()?;
                    env.heap.set_static(slot, value.narrow(field.kind));
                }
                GETFIELD => {
                    let slot = field.instance.ok_or_else(mismatch)?;
                    let reference = frame.pop_ref()?;
                    let fields = env.instance_fields(reference, field.owner)?;
                    let value = fields.get(slot).copied().ok_or_else(mismatch)?;
                    frame.push(value);
                }
                _ => {
                    let slot = field.instance.ok_or_else(mismatch)?;
                    let value = frame.pop()?;
                    let reference = frame.pop_ref()?;
                    let fields = env.instance_fields(reference, field.owner)?;
                    *fields.get_mut(slot).ok_or_else(mismatch)? = value.narrow(field.kind);
                }
            }
        }

        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => match insn.operand {
            Operand::Container(call) => return container_op(env, frame, call),
            Operand::Method(index) => {
                let PoolTarget::Method(target) = class.pool_entry(index) else {
                    return Err(mismatch());
                };
                let target = target.clone();
                return invoke(env, frame, op, target);
            }
            _ => return Err(mismatch()),
        },

        NEW => {
            let Operand::Class(index) = insn.operand else { return Err(mismatch()) };
            let PoolTarget::Class(ClassTarget::Type(ty)) = *class.pool_entry(index) else {
                return Err(mismatch());
            };
            let id = env.new_instance(ty)?;
            frame.push(Value::Ref(Some(id)));
        }
        ANEWARRAY => {
            let length = frame.pop_int()?;
            let id = env.new_container(ElementKind::Object, length)?;
            frame.push(Value::Ref(Some(id)));
        }
        ATHROW => {
            let reference = frame.pop_ref()?;
            let thrown = env.instance_class(reference)?;
            let throwable = unit.registry().lookup(builtins::THROWABLE).ok_or_else(mismatch)?;
            if !unit.registry().is_subtype(thrown, throwable) {
                return Err(cast_error(builtins::THROWABLE, class_name(unit, thrown)).into());
            }
            return Err(Fault::Throw(reference.ok_or_else(mismatch)?));
        }
        CHECKCAST | INSTANCEOF => {
            let Operand::Class(index) = insn.operand else { return Err(mismatch()) };
            let PoolTarget::Class(target) = *class.pool_entry(index) else {
                return Err(mismatch());
            };
            let reference = frame.pop_ref()?;
            let matches = match reference {
                Some(id) => env.is_instance(id, target)?,
                None => false,
            };
            if op == INSTANCEOF {
                frame.push(Value::Int(matches as i32));
            } else if matches || reference.is_none() {
                frame.push(Value::Ref(reference));
            } else {
                let found = match &env.load(reference)?.body {
                    ObjectBody::Instance { class, .. } => class_name(unit, *class),
                    ObjectBody::Container(container) => container.kind().to_string(),
                };
                return Err(cast_error(env.target_name(target), found).into());
            }
        }
        MONITORENTER | MONITOREXIT => {
            if frame.pop_ref()?.is_none() {
                return Err(CapabilityViolation::NullReference.into());
            }
        }

        _ => return Err(mismatch()),
    }
    Ok(Step::Next)
}
