//! Rewriting of native array instructions into container calls.
//!
//! Sandboxed code never touches a raw array. Every primitive element load and store becomes a
//! virtual call on the matching [`TypedContainer`](crate::TypedContainer) accessor, every
//! `arraylength` becomes a virtual `length` call and every `newarray` becomes a static call on
//! the container factory of its element kind. Reference-array loads and stores are left alone:
//! they already operate on an object container.
//!
//! The substitution is strictly one-for-one, so branch targets and handler ranges (instruction
//! indices) survive unchanged. Any other instruction passes through.

use tracing::trace;

use crate::{
    bytecode::{opcode::*, ContainerCall, Instruction, Operand},
    validate::{analyze_frames, ShapeViolation, VerifiedMethod},
    ConstantPool, ElementKind, FieldKind,
};

/// Element kind of a primitive array load or store, `None` for the reference-array forms.
const fn array_element(op: u8) -> Option<ElementKind> {
    let offset = match op {
        IALOAD..=SALOAD => op - IALOAD,
        IASTORE..=SASTORE => op - IASTORE,
        _ => return None,
    };
    match offset {
        0 => Some(ElementKind::Int),
        1 => Some(ElementKind::Long),
        2 => Some(ElementKind::Float),
        3 => Some(ElementKind::Double),
        5 => Some(ElementKind::Byte),
        6 => Some(ElementKind::Char),
        7 => Some(ElementKind::Short),
        _ => None,
    }
}

/// The container call replacing `insn`, if it is a native array instruction.
pub const fn container_call(insn: &Instruction) -> Option<Instruction> {
    let call = match (insn.opcode, insn.operand) {
        (IALOAD..=SALOAD, _) => match array_element(insn.opcode) {
            Some(kind) => ContainerCall::Get(kind),
            None => return None,
        },
        (IASTORE..=SASTORE, _) => match array_element(insn.opcode) {
            Some(kind) => ContainerCall::Set(kind),
            None => return None,
        },
        (ARRAYLENGTH, _) => ContainerCall::Length,
        (NEWARRAY, Operand::ArrayType(kind)) => {
            return Some(Instruction {
                opcode: INVOKESTATIC,
                operand: Operand::Container(ContainerCall::Allocate(kind)),
            })
        }
        _ => return None,
    };
    Some(Instruction { opcode: INVOKEVIRTUAL, operand: Operand::Container(call) })
}

/// Substitutes every native array instruction in `code`, returning how many were replaced.
pub fn wrap_arrays(code: &mut [Instruction]) -> usize {
    let mut substituted = 0;
    for insn in code.iter_mut() {
        if let Some(call) = container_call(insn) {
            *insn = call;
            substituted += 1;
        }
    }
    substituted
}

/// Result of rewriting one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Instructions replaced.
    pub substitutions: usize,
    /// Whether the stack shape information had to be recomputed.
    pub frames_stale: bool,
}

/// Rewrites a verified method in place.
///
/// A method that changed has its operand stack depth recomputed against the rewritten
/// instructions; the result must stay within `max_stack_depth`.
pub fn rewrite_method(
    method: &mut VerifiedMethod,
    pool: &ConstantPool,
    ret: Option<FieldKind>,
    max_stack_depth: u16,
) -> Result<RewriteReport, ShapeViolation> {
    let substitutions = wrap_arrays(&mut method.instructions);
    if substitutions == 0 {
        return Ok(RewriteReport::default());
    }
    method.max_stack =
        analyze_frames(&method.instructions, &method.handlers, pool, ret, max_stack_depth)?;
    trace!(target: "avm::rewrite", substitutions, max_stack = method.max_stack, "Method rewritten");
    Ok(RewriteReport { substitutions, frames_stale: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_arrays_pass_through() {
        let mut code = vec![
            Instruction::simple(AALOAD),
            Instruction::simple(AASTORE),
            Instruction::simple(NOP),
        ];
        let before = code.clone();
        assert_eq!(wrap_arrays(&mut code), 0);
        assert_eq!(code, before);
    }

    #[test]
    fn test_primitive_forms_are_substituted() {
        let mut code = vec![
            Instruction::simple(BALOAD),
            Instruction::simple(CASTORE),
            Instruction::simple(ARRAYLENGTH),
            Instruction { opcode: NEWARRAY, operand: Operand::ArrayType(ElementKind::Double) },
        ];
        assert_eq!(wrap_arrays(&mut code), 4);
        assert_eq!(
            code,
            vec![
                Instruction {
                    opcode: INVOKEVIRTUAL,
                    operand: Operand::Container(ContainerCall::Get(ElementKind::Byte))
                },
                Instruction {
                    opcode: INVOKEVIRTUAL,
                    operand: Operand::Container(ContainerCall::Set(ElementKind::Char))
                },
                Instruction {
                    opcode: INVOKEVIRTUAL,
                    operand: Operand::Container(ContainerCall::Length)
                },
                Instruction {
                    opcode: INVOKESTATIC,
                    operand: Operand::Container(ContainerCall::Allocate(ElementKind::Double))
                },
            ]
        );
        // Rewriting is idempotent.
        assert_eq!(wrap_arrays(&mut code), 0);
    }
}
