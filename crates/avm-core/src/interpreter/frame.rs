use crate::{unit::MethodHandle, InstanceId, Value};

use super::InvocationFailure;

/// One method activation: its locals, operand stack and position.
///
/// Locals are addressed by slot. A `long` or `double` lives at its index and the following
/// slot holds a filler that is never read.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) method: MethodHandle,
    pub(crate) pc: usize,
    pub(crate) locals: Vec<Value>,
    pub(crate) stack: Vec<Value>,
}

impl Frame {
    /// A frame whose first locals hold `args` (the receiver first, for instance methods).
    pub(crate) fn new(method: MethodHandle, max_locals: u16, args: Vec<Value>) -> Self {
        let mut locals = Vec::with_capacity(max_locals as usize);
        for arg in args {
            let wide = arg.slots() == 2;
            locals.push(arg);
            if wide {
                locals.push(Value::Int(0));
            }
        }
        locals.resize(locals.len().max(max_locals as usize), Value::Int(0));
        Self { method, pc: 0, locals, stack: Vec::new() }
    }

    const fn mismatch(&self) -> InvocationFailure {
        InvocationFailure::OperandMismatch { at: self.pc }
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, InvocationFailure> {
        self.stack.pop().ok_or(self.mismatch())
    }

    pub(crate) fn pop_int(&mut self) -> Result<i32, InvocationFailure> {
        let value = self.pop()?;
        value.as_int().ok_or(self.mismatch())
    }

    pub(crate) fn pop_long(&mut self) -> Result<i64, InvocationFailure> {
        let value = self.pop()?;
        value.as_long().ok_or(self.mismatch())
    }

    pub(crate) fn pop_float(&mut self) -> Result<f32, InvocationFailure> {
        let value = self.pop()?;
        value.as_float().ok_or(self.mismatch())
    }

    pub(crate) fn pop_double(&mut self) -> Result<f64, InvocationFailure> {
        let value = self.pop()?;
        value.as_double().ok_or(self.mismatch())
    }

    pub(crate) fn pop_ref(&mut self) -> Result<Option<InstanceId>, InvocationFailure> {
        let value = self.pop()?;
        value.as_reference().ok_or(self.mismatch())
    }

    /// Pops `count` values, returned in push order.
    pub(crate) fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, InvocationFailure> {
        let split = self.stack.len().checked_sub(count).ok_or(self.mismatch())?;
        Ok(self.stack.split_off(split))
    }

    pub(crate) fn local(&self, index: u16) -> Result<Value, InvocationFailure> {
        self.locals.get(index as usize).copied().ok_or(self.mismatch())
    }

    pub(crate) fn set_local(&mut self, index: u16, value: Value) -> Result<(), InvocationFailure> {
        let index = index as usize;
        let end = index + value.slots() as usize;
        if end > self.locals.len() {
            return Err(self.mismatch());
        }
        self.locals[index] = value;
        if end == index + 2 {
            self.locals[index + 1] = Value::Int(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClassId;

    fn handle() -> MethodHandle {
        MethodHandle { class: ClassId(11), index: 0 }
    }

    #[test]
    fn test_wide_arguments_take_two_slots() {
        let frame = Frame::new(handle(), 5, vec![Value::Int(1), Value::Long(2), Value::Int(3)]);
        assert_eq!(frame.locals.len(), 5);
        assert_eq!(frame.local(0).unwrap(), Value::Int(1));
        assert_eq!(frame.local(1).unwrap(), Value::Long(2));
        assert_eq!(frame.local(3).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_operand_mismatch_reports_position() {
        let mut frame = Frame::new(handle(), 0, vec![]);
        frame.pc = 7;
        frame.push(Value::Float(1.0));
        assert_eq!(frame.pop_int(), Err(InvocationFailure::OperandMismatch { at: 7 }));
        assert_eq!(frame.pop(), Err(InvocationFailure::OperandMismatch { at: 7 }));
        assert!(frame.set_local(0, Value::Int(1)).is_err());
    }
}
