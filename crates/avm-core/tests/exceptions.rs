//! Tests for capability violations, user exceptions and explicit reverts.

use alloy_primitives::{address, Address, Bytes};
use avm_core::{
    bytecode::opcode::*,
    root_key,
    test_utils::{
        deployed, invoke, ClassBuilder, CodeBuilder, MemoryWorldState, ModuleBuilder, TEST_ENERGY,
    },
    InvocationFailure, InvocationRequest, InvocationStatus, Sandbox, SandboxConfig, Value,
    WorldState,
};
use rstest::rstest;

const CONTRACT: Address = address!("00000000000000000000000000000000000e0e0e");

/// `a / b`, with the division wrapped in a handler for `catch_type` that returns `fallback`.
fn guarded_divide(code: &mut CodeBuilder<'_>, catch_type: Option<&str>, fallback: i32) {
    let start = code.here();
    let end = code.label();
    code.iload(0).iload(1).op(IDIV).op(IRETURN);
    code.bind(end);
    let handler = code.here();
    code.op(POP).iconst(fallback).op(IRETURN);
    code.try_catch(start, end, handler, catch_type);
}

fn exceptions_module() -> Bytes {
    let oops = ClassBuilder::new("Oops").extends("avm/Exception").default_constructor();
    let boxed = ClassBuilder::new("Box").field("value", "I").default_constructor();
    let main = ClassBuilder::new("Main")
        .static_field("touched", "I")
        .static_method("divide", "(II)I", |code| {
            code.iload(0).iload(1).op(IDIV).op(IRETURN);
        })
        .static_method("catchExact", "(II)I", |code| {
            guarded_divide(code, Some("avm/ArithmeticException"), -1);
        })
        .static_method("catchParent", "(II)I", |code| {
            guarded_divide(code, Some("avm/RuntimeException"), -2);
        })
        .static_method("catchAny", "(II)I", |code| {
            guarded_divide(code, None, -3);
        })
        .static_method("catchWrong", "(II)I", |code| {
            guarded_divide(code, Some("avm/NullPointerException"), -4);
        })
        .static_method("fail", "()V", |code| {
            code.construct("Oops").op(ATHROW);
        })
        // Catches an `Oops` thrown two frames down.
        .static_method("relay", "()V", |code| {
            code.invokestatic("Main", "fail", "()V").op(RETURN);
        })
        .static_method("catchOops", "()I", |code| {
            let start = code.here();
            let end = code.label();
            code.invokestatic("Main", "relay", "()V").iconst(0).op(IRETURN);
            code.bind(end);
            let handler = code.here();
            code.instanceof("avm/Throwable").op(IRETURN);
            code.try_catch(start, end, handler, Some("Oops"));
        })
        .static_method("nullField", "()I", |code| {
            code.op(ACONST_NULL).getfield("Box", "value", "I").op(IRETURN);
        })
        .static_method("throwNull", "()V", |code| {
            code.op(ACONST_NULL).op(ATHROW);
        })
        .static_method("badCast", "()V", |code| {
            code.construct("Box").checkcast("Oops").op(POP).op(RETURN);
        })
        .static_method("throwBox", "()V", |code| {
            code.construct("Box").op(ATHROW);
        })
        .static_method("getTouched", "()I", |code| {
            code.getstatic("Main", "touched", "I").op(IRETURN);
        })
        .static_method("touchAndRevert", "()V", |code| {
            code.iconst(9).putstatic("Main", "touched", "I");
            code.native("revert", "()V").op(RETURN);
        })
        .static_method("touchAndThrow", "()V", |code| {
            code.iconst(9).putstatic("Main", "touched", "I");
            code.iconst(1).iconst(0).op(IDIV).op(POP).op(RETURN);
        })
        // Writes made before a caught exception stay.
        .static_method("touchAndCatch", "()I", |code| {
            let start = code.here();
            let end = code.label();
            code.iconst(5).putstatic("Main", "touched", "I");
            code.iconst(1).iconst(0).op(IDIV).op(IRETURN);
            code.bind(end);
            let handler = code.here();
            code.op(POP).getstatic("Main", "touched", "I").op(IRETURN);
            code.try_catch(start, end, handler, None);
        });
    ModuleBuilder::new("Main").class(main).class(oops).class(boxed).encode()
}

fn deploy() -> (Sandbox, MemoryWorldState) {
    deployed(SandboxConfig::default(), CONTRACT, exceptions_module())
}

fn uncaught(class: &str) -> Option<InvocationFailure> {
    Some(InvocationFailure::Uncaught { class: class.into() })
}

#[rstest]
#[case::exact("catchExact", -1)]
#[case::parent_type("catchParent", -2)]
#[case::any("catchAny", -3)]
fn test_division_by_zero_is_caught(#[case] method: &str, #[case] fallback: i32) {
    let (mut sandbox, mut world) = deploy();
    let mut call = |b: i32| {
        let args = vec![Value::Int(7), Value::Int(b)];
        invoke(&mut sandbox, &mut world, CONTRACT, method, "(II)I", args).return_value
    };
    assert_eq!(call(2), Some(Value::Int(3)));
    assert_eq!(call(0), Some(Value::Int(fallback)));
}

#[rstest]
#[case::unguarded("divide")]
#[case::wrong_handler("catchWrong")]
fn test_division_by_zero_escapes(#[case] method: &str) {
    let (mut sandbox, mut world) = deploy();
    let args = vec![Value::Int(1), Value::Int(0)];
    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, method, "(II)I", args);
    assert_eq!(outcome.status, InvocationStatus::Revert);
    assert_eq!(outcome.failure, uncaught("avm/ArithmeticException"));
    assert_eq!(outcome.return_value, None);
}

#[test]
fn test_user_exception_unwinds_frames() {
    let (mut sandbox, mut world) = deploy();

    let caught = invoke(&mut sandbox, &mut world, CONTRACT, "catchOops", "()I", vec![]);
    assert_eq!(caught.return_value, Some(Value::Int(1)));

    let escaped = invoke(&mut sandbox, &mut world, CONTRACT, "relay", "()V", vec![]);
    assert_eq!(escaped.status, InvocationStatus::Revert);
    assert_eq!(escaped.failure, uncaught("Oops"));
}

#[rstest]
#[case::null_field("nullField", "()I", "avm/NullPointerException")]
#[case::null_throw("throwNull", "()V", "avm/NullPointerException")]
#[case::bad_cast("badCast", "()V", "avm/ClassCastException")]
#[case::not_throwable("throwBox", "()V", "avm/ClassCastException")]
fn test_capability_violations(
    #[case] method: &str,
    #[case] descriptor: &str,
    #[case] exception: &str,
) {
    let (mut sandbox, mut world) = deploy();
    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, method, descriptor, vec![]);
    assert_eq!(outcome.status, InvocationStatus::Revert);
    assert_eq!(outcome.failure, uncaught(exception));
}

#[rstest]
#[case::revert("touchAndRevert", Some(InvocationFailure::Reverted))]
#[case::throw("touchAndThrow", uncaught("avm/ArithmeticException"))]
fn test_failed_invocation_discards_writes(
    #[case] method: &str,
    #[case] failure: Option<InvocationFailure>,
) {
    let (mut sandbox, mut world) = deploy();
    let before = world.clone();

    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, method, "()V", vec![]);
    assert_eq!(outcome.status, InvocationStatus::Revert);
    assert_eq!(outcome.failure, failure);
    assert!(outcome.energy_used > 0);
    assert_eq!(outcome.usage.storage_write, 0);
    assert_eq!(outcome.root_state, world.storage_value(CONTRACT, &root_key()));
    assert_eq!(world, before);

    let touched = invoke(&mut sandbox, &mut world, CONTRACT, "getTouched", "()I", vec![]);
    assert_eq!(touched.return_value, Some(Value::Int(0)));
}

#[test]
fn test_caught_exception_keeps_writes() {
    let (mut sandbox, mut world) = deploy();

    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, "touchAndCatch", "()I", vec![]);
    assert_eq!(outcome.return_value, Some(Value::Int(5)));
    let touched = invoke(&mut sandbox, &mut world, CONTRACT, "getTouched", "()I", vec![]);
    assert_eq!(touched.return_value, Some(Value::Int(5)));
}

/// Serves `world`, but fails every root record read after the first `allowed`.
struct FailingRootReads<'a> {
    world: &'a mut MemoryWorldState,
    allowed: usize,
}

impl WorldState for FailingRootReads<'_> {
    type Error = String;

    fn code(&mut self, address: Address) -> Result<Bytes, Self::Error> {
        Ok(self.world.code_of(address))
    }

    fn put_code(&mut self, address: Address, code: Bytes) -> Result<(), Self::Error> {
        self.world.set_code(address, code);
        Ok(())
    }

    fn storage(&mut self, address: Address, key: &[u8]) -> Result<Bytes, Self::Error> {
        if key == root_key().as_ref() {
            if self.allowed == 0 {
                return Err("root record unreadable".into());
            }
            self.allowed -= 1;
        }
        Ok(self.world.storage_value(address, key))
    }

    fn put_storage(
        &mut self,
        address: Address,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), Self::Error> {
        self.world.set_storage(address, key, value);
        Ok(())
    }
}

#[test]
fn test_unreadable_root_after_failure_is_reported() {
    let (mut sandbox, mut world) = deploy();
    let before = world.clone();
    let request = InvocationRequest::new(CONTRACT, "touchAndRevert", "()V", TEST_ENERGY);

    // The activation reads the root; reading it again for the outcome fails.
    let state = FailingRootReads { world: &mut world, allowed: 1 };
    let outcome = sandbox.call(state, &request);
    assert_eq!(outcome.status, InvocationStatus::RejectedAtRuntime);
    assert!(matches!(outcome.failure, Some(InvocationFailure::Storage(_))));
    assert!(outcome.root_state.is_empty());
    assert_eq!(world, before);

    let state = FailingRootReads { world: &mut world, allowed: usize::MAX };
    let outcome = sandbox.call(state, &request);
    assert_eq!(outcome.failure, Some(InvocationFailure::Reverted));
    assert_eq!(outcome.root_state, before.storage_value(CONTRACT, &root_key()));
}
