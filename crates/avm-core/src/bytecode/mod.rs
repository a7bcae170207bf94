//! Decoding of raw method code into an indexed instruction list.
//!
//! Decoding normalizes the encoding-level shortcuts away: `iload_1` becomes `iload 1`, `wide`
//! prefixes are folded into their instruction, `ldc_w` becomes `ldc` and `goto_w` becomes
//! `goto`. Branch offsets are resolved to instruction indices, so later passes can substitute
//! instructions one-for-one without touching any jump or handler range.

pub mod opcode;

use crate::ElementKind;

/// Errors raised while decoding method code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The opcode is unknown or not accepted in contract code.
    #[error("unsupported opcode {opcode:#04x} at pc {pc}")]
    UnsupportedOpcode {
        /// Byte offset of the instruction.
        pc: usize,
        /// The opcode.
        opcode: u8,
    },
    /// The code ends in the middle of an instruction's operands.
    #[error("truncated instruction at pc {pc}")]
    Truncated {
        /// Byte offset of the instruction.
        pc: usize,
    },
    /// A branch lands outside the code or between instruction boundaries.
    #[error("branch at pc {pc} targets invalid offset {target}")]
    InvalidBranchTarget {
        /// Byte offset of the branch.
        pc: usize,
        /// The computed target offset.
        target: i64,
    },
    /// A `newarray` names an unknown element type.
    #[error("invalid newarray type {atype} at pc {pc}")]
    InvalidArrayType {
        /// Byte offset of the instruction.
        pc: usize,
        /// The element type code.
        atype: u8,
    },
    /// A `wide` prefix modifies an instruction that has no local index.
    #[error("invalid wide-prefixed opcode {opcode:#04x} at pc {pc}")]
    InvalidWide {
        /// Byte offset of the `wide` prefix.
        pc: usize,
        /// The modified opcode.
        opcode: u8,
    },
}

/// A container operation substituted for a native array instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerCall {
    /// Bounds-checked element read.
    Get(ElementKind),
    /// Bounds-checked element write.
    Set(ElementKind),
    /// Container length, for every element kind.
    Length,
    /// Static factory allocating a container of the given kind.
    Allocate(ElementKind),
}

/// The operand of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// No operand.
    None,
    /// An immediate integer (`bipush`, `sipush`).
    Int(i32),
    /// A local variable index.
    Local(u16),
    /// `iinc` operands.
    Iinc {
        /// Local variable index.
        index: u16,
        /// Signed increment.
        delta: i16,
    },
    /// A pool index of a literal constant.
    Constant(u16),
    /// A pool index of a field reference.
    Field(u16),
    /// A pool index of a method reference.
    Method(u16),
    /// A pool index of a class entry.
    Class(u16),
    /// A branch target, as an instruction index.
    Branch(usize),
    /// The element kind of a `newarray`.
    ArrayType(ElementKind),
    /// A substituted container call.
    Container(ContainerCall),
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// The normalized opcode.
    pub opcode: u8,
    /// The operand.
    pub operand: Operand,
}

impl Instruction {
    /// An instruction without operand.
    pub const fn simple(opcode: u8) -> Self {
        Self { opcode, operand: Operand::None }
    }

    /// Number of local slots the instruction's local variable access spans, if any.
    pub const fn local_access(&self) -> Option<(u16, u16)> {
        match self.operand {
            Operand::Local(index) => {
                let width = match self.opcode {
                    opcode::LLOAD | opcode::DLOAD | opcode::LSTORE | opcode::DSTORE => 2,
                    _ => 1,
                };
                Some((index, width))
            }
            Operand::Iinc { index, .. } => Some((index, 1)),
            _ => None,
        }
    }
}

/// The decoded form of one method's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    /// Instructions, in code order.
    pub instructions: Vec<Instruction>,
    /// Byte offset of every instruction.
    pub offsets: Vec<usize>,
    /// Total code length in bytes.
    pub code_len: usize,
}

impl DecodedCode {
    /// Maps a byte offset to an instruction index. The code length maps to one past the last
    /// instruction, so it can close a handler range.
    pub fn index_of(&self, pc: usize) -> Option<usize> {
        if pc == self.code_len {
            return Some(self.instructions.len());
        }
        self.offsets.binary_search(&pc).ok()
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.code.get(self.pos).ok_or(DecodeError::Truncated { pc: self.start })?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn branch(&self, offset: i64) -> Result<Operand, DecodeError> {
        let target = self.start as i64 + offset;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(DecodeError::InvalidBranchTarget { pc: self.start, target });
        }
        Ok(Operand::Branch(target as usize))
    }
}

/// Decodes raw method code.
pub fn decode(code: &[u8]) -> Result<DecodedCode, DecodeError> {
    use opcode::*;

    let mut instructions = Vec::new();
    let mut offsets = Vec::new();
    let mut reader = Reader { code, pos: 0, start: 0 };

    while reader.pos < code.len() {
        reader.start = reader.pos;
        let op = reader.u8()?;
        if !is_supported(op) {
            return Err(DecodeError::UnsupportedOpcode { pc: reader.start, opcode: op });
        }
        let (opcode, operand) = match op {
            BIPUSH => (op, Operand::Int(reader.u8()? as i8 as i32)),
            SIPUSH => (op, Operand::Int(reader.i16()? as i32)),
            LDC => (LDC, Operand::Constant(reader.u8()? as u16)),
            LDC_W => (LDC, Operand::Constant(reader.u16()?)),
            LDC2_W => (op, Operand::Constant(reader.u16()?)),
            ILOAD..=ALOAD | ISTORE..=ASTORE => (op, Operand::Local(reader.u8()? as u16)),
            ILOAD_0..=ALOAD_3 => {
                let n = op - ILOAD_0;
                (ILOAD + n / 4, Operand::Local((n % 4) as u16))
            }
            ISTORE_0..=ASTORE_3 => {
                let n = op - ISTORE_0;
                (ISTORE + n / 4, Operand::Local((n % 4) as u16))
            }
            IINC => {
                let index = reader.u8()? as u16;
                let delta = reader.u8()? as i8 as i16;
                (op, Operand::Iinc { index, delta })
            }
            WIDE => {
                let modified = reader.u8()?;
                match modified {
                    ILOAD..=ALOAD | ISTORE..=ASTORE => (modified, Operand::Local(reader.u16()?)),
                    IINC => {
                        let index = reader.u16()?;
                        let delta = reader.i16()?;
                        (modified, Operand::Iinc { index, delta })
                    }
                    _ => {
                        return Err(DecodeError::InvalidWide { pc: reader.start, opcode: modified })
                    }
                }
            }
            IFEQ..=IF_ACMPNE | GOTO | IFNULL | IFNONNULL => {
                let offset = reader.i16()? as i64;
                (op, reader.branch(offset)?)
            }
            GOTO_W => {
                let offset = reader.i32()? as i64;
                (GOTO, reader.branch(offset)?)
            }
            GETSTATIC..=PUTFIELD => (op, Operand::Field(reader.u16()?)),
            INVOKEVIRTUAL..=INVOKESTATIC => (op, Operand::Method(reader.u16()?)),
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => (op, Operand::Class(reader.u16()?)),
            NEWARRAY => {
                let atype = reader.u8()?;
                let kind = ElementKind::from_array_type(atype)
                    .ok_or(DecodeError::InvalidArrayType { pc: reader.start, atype })?;
                (op, Operand::ArrayType(kind))
            }
            _ => (op, Operand::None),
        };
        offsets.push(reader.start);
        instructions.push(Instruction { opcode, operand });
    }

    // Branch operands hold byte offsets until every instruction boundary is known.
    for (i, insn) in instructions.iter_mut().enumerate() {
        if let Operand::Branch(target) = insn.operand {
            let index = offsets.binary_search(&target).map_err(|_| {
                DecodeError::InvalidBranchTarget { pc: offsets[i], target: target as i64 }
            })?;
            insn.operand = Operand::Branch(index);
        }
    }

    Ok(DecodedCode { instructions, offsets, code_len: code.len() })
}

/// Pops entries totalling exactly `words` slots and returns them in stack order. Fails if the
/// stack is too shallow or a two-slot entry straddles the boundary.
fn take_words<T>(stack: &mut Vec<T>, words: u16, width: impl Fn(&T) -> u16) -> Option<Vec<T>> {
    let mut taken = 0;
    let mut out = Vec::new();
    while taken < words {
        let entry = stack.pop()?;
        taken += width(&entry);
        out.push(entry);
    }
    if taken != words {
        return None;
    }
    out.reverse();
    Some(out)
}

/// Applies one of the untyped stack instructions (`pop` through `swap`) in terms of slots, so
/// the validator (over value kinds) and the interpreter (over values) share one definition.
pub(crate) fn shuffle<T: Clone>(
    op: u8,
    stack: &mut Vec<T>,
    width: impl Fn(&T) -> u16 + Copy,
) -> Option<()> {
    use opcode::*;

    let (top, under) = match op {
        POP | DUP => (1, 0),
        POP2 | DUP2 => (2, 0),
        DUP_X1 | SWAP => (1, 1),
        DUP_X2 => (1, 2),
        DUP2_X1 => (2, 1),
        DUP2_X2 => (2, 2),
        _ => return None,
    };
    let top_words = take_words(stack, top, width)?;
    match op {
        POP | POP2 => {}
        SWAP => {
            let under_words = take_words(stack, under, width)?;
            stack.extend(top_words);
            stack.extend(under_words);
        }
        _ => {
            let under_words = take_words(stack, under, width)?;
            stack.extend(top_words.iter().cloned());
            stack.extend(under_words);
            stack.extend(top_words);
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::{opcode::*, *};

    #[test]
    fn test_shuffle_by_slots() {
        let width = |w: &(char, u16)| w.1;
        let mut stack = vec![('a', 1), ('b', 1)];
        shuffle(DUP_X1, &mut stack, width).unwrap();
        assert_eq!(stack, vec![('b', 1), ('a', 1), ('b', 1)]);

        let mut stack = vec![('l', 2), ('i', 1)];
        shuffle(DUP_X2, &mut stack, width).unwrap();
        assert_eq!(stack, vec![('i', 1), ('l', 2), ('i', 1)]);

        let mut stack = vec![('a', 1), ('l', 2)];
        shuffle(DUP2_X1, &mut stack, width).unwrap();
        assert_eq!(stack, vec![('l', 2), ('a', 1), ('l', 2)]);

        let mut stack = vec![('a', 1), ('b', 1)];
        shuffle(SWAP, &mut stack, width).unwrap();
        assert_eq!(stack, vec![('b', 1), ('a', 1)]);

        // A two-slot value cannot be split by a one-slot pop.
        let mut stack = vec![('l', 2)];
        assert!(shuffle(POP, &mut stack, width).is_none());
        let mut stack = vec![('a', 1)];
        assert!(shuffle(POP2, &mut stack, width).is_none());
    }

    #[test]
    fn test_shortcut_forms_are_normalized() {
        let code = [ILOAD_2, LSTORE_3, ALOAD_0, WIDE, DLOAD, 0x01, 0x00, LDC_W, 0x00, 0x07, RETURN];
        let decoded = decode(&code).unwrap();
        assert_eq!(
            decoded.instructions,
            vec![
                Instruction { opcode: ILOAD, operand: Operand::Local(2) },
                Instruction { opcode: LSTORE, operand: Operand::Local(3) },
                Instruction { opcode: ALOAD, operand: Operand::Local(0) },
                Instruction { opcode: DLOAD, operand: Operand::Local(256) },
                Instruction { opcode: LDC, operand: Operand::Constant(7) },
                Instruction::simple(RETURN),
            ]
        );
        assert_eq!(decoded.offsets, vec![0, 1, 2, 3, 7, 10]);
        assert_eq!(decoded.instructions[3].local_access(), Some((256, 2)));
    }

    #[test]
    fn test_branches_resolve_to_indices() {
        // pc 0 iconst_0, pc 1 ifeq +8 (to pc 9), pc 4 goto_w -4 (to pc 0), pc 9 return
        let code = [ICONST_0, IFEQ, 0x00, 0x08, GOTO_W, 0xff, 0xff, 0xff, 0xfc, RETURN];
        let decoded = decode(&code).unwrap();
        assert_eq!(decoded.instructions[1].operand, Operand::Branch(3));
        assert_eq!(
            decoded.instructions[2],
            Instruction { opcode: GOTO, operand: Operand::Branch(0) }
        );
        assert_eq!(decoded.index_of(9), Some(3));
        assert_eq!(decoded.index_of(10), Some(4));
        assert_eq!(decoded.index_of(2), None);
    }

    #[test]
    fn test_invalid_code_is_rejected() {
        assert_eq!(
            decode(&[JSR, 0, 0]),
            Err(DecodeError::UnsupportedOpcode { pc: 0, opcode: JSR })
        );
        assert_eq!(decode(&[NOP, SIPUSH, 1]), Err(DecodeError::Truncated { pc: 1 }));
        assert_eq!(
            decode(&[GOTO, 0x00, 0x02, RETURN]),
            Err(DecodeError::InvalidBranchTarget { pc: 0, target: 2 })
        );
        assert_eq!(
            decode(&[GOTO, 0x00, 0x09]),
            Err(DecodeError::InvalidBranchTarget { pc: 0, target: 9 })
        );
        assert_eq!(
            decode(&[ICONST_1, NEWARRAY, 3]),
            Err(DecodeError::InvalidArrayType { pc: 1, atype: 3 })
        );
        assert_eq!(decode(&[WIDE, NOP]), Err(DecodeError::InvalidWide { pc: 0, opcode: NOP }));
    }

    #[test]
    fn test_boolean_arrays_use_byte_kind() {
        let decoded = decode(&[ICONST_1, NEWARRAY, T_BOOLEAN, POP, RETURN]).unwrap();
        assert_eq!(decoded.instructions[1].operand, Operand::ArrayType(ElementKind::Byte));
    }
}
