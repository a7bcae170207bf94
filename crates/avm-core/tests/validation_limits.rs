//! Tests for the deployment-time ceilings: a value exactly at a ceiling passes, one past it is
//! rejected.

use alloy_primitives::Bytes;
use avm_core::{
    bytecode::opcode::*,
    constants::limits,
    test_utils::{ClassBuilder, CodeBuilder, ModuleBuilder},
    validate_and_rewrite, ShapeViolation, StaticRejection, ValidationLimits,
};
use rstest::rstest;

fn single_method(descriptor: &str, emit: impl FnOnce(&mut CodeBuilder<'_>)) -> Bytes {
    ModuleBuilder::new("Main")
        .class(ClassBuilder::new("Main").static_method("run", descriptor, emit))
        .encode()
}

/// The violation a module was rejected with, `None` if it was accepted.
fn violation(code: &[u8], limits: &ValidationLimits) -> Option<ShapeViolation> {
    match validate_and_rewrite(code, limits) {
        Ok(_) => None,
        Err(StaticRejection::Method(rejection)) => Some(rejection.violation),
        Err(other) => panic!("unexpected rejection: {other}"),
    }
}

#[rstest]
#[case::at_ceiling(15, None)]
#[case::past_ceiling(16, Some(ShapeViolation::MethodTooLong { length: 17, limit: 16 }))]
fn test_method_byte_length(#[case] nops: usize, #[case] expected: Option<ShapeViolation>) {
    let limits = ValidationLimits { max_method_byte_length: 16, ..Default::default() };
    let code = single_method("()V", |code| {
        code.nops(nops).op(RETURN);
    });
    assert_eq!(violation(&code, &limits), expected);
}

#[test]
fn test_default_byte_length_ceiling() {
    let limits = ValidationLimits::default();
    let at = single_method("()V", |code| {
        code.nops(limits::MAX_METHOD_BYTE_LENGTH - 1).op(RETURN);
    });
    assert_eq!(violation(&at, &limits), None);

    let past = single_method("()V", |code| {
        code.nops(limits::MAX_METHOD_BYTE_LENGTH).op(RETURN);
    });
    assert_eq!(
        violation(&past, &limits),
        Some(ShapeViolation::MethodTooLong {
            length: limits::MAX_METHOD_BYTE_LENGTH + 1,
            limit: limits::MAX_METHOD_BYTE_LENGTH,
        })
    );
}

fn with_handlers(count: usize) -> Bytes {
    single_method("()V", |code| {
        let start = code.here();
        let end = code.label();
        code.op(NOP).bind(end).op(RETURN);
        let handler = code.here();
        code.op(POP).op(RETURN);
        for _ in 0..count {
            code.try_catch(start, end, handler, None);
        }
    })
}

#[rstest]
#[case::at_ceiling(2, None)]
#[case::past_ceiling(3, Some(ShapeViolation::TooManyExceptionHandlers { count: 3, limit: 2 }))]
fn test_exception_table_entries(#[case] count: usize, #[case] expected: Option<ShapeViolation>) {
    let limits = ValidationLimits { max_exception_handlers: 2, ..Default::default() };
    assert_eq!(violation(&with_handlers(count), &limits), expected);
}

#[test]
fn test_default_exception_table_ceiling() {
    let limits = ValidationLimits::default();
    assert_eq!(violation(&with_handlers(limits::MAX_EXCEPTION_TABLE_ENTRIES), &limits), None);
    assert_eq!(
        violation(&with_handlers(limits::MAX_EXCEPTION_TABLE_ENTRIES + 1), &limits),
        Some(ShapeViolation::TooManyExceptionHandlers {
            count: limits::MAX_EXCEPTION_TABLE_ENTRIES + 1,
            limit: limits::MAX_EXCEPTION_TABLE_ENTRIES,
        })
    );
}

#[rstest]
#[case::ints_at_ceiling(&[ICONST_0, ICONST_0, ICONST_0, ICONST_0], None)]
#[case::ints_past_ceiling(&[ICONST_0, ICONST_0, ICONST_0, ICONST_0, ICONST_0], Some(5))]
#[case::longs_at_ceiling(&[LCONST_0, LCONST_0], None)]
#[case::longs_past_ceiling(&[ICONST_0, LCONST_0, LCONST_0], Some(5))]
#[case::doubles_past_ceiling(&[DCONST_0, DCONST_0, FCONST_0], Some(5))]
fn test_operand_stack_depth(#[case] pushes: &[u8], #[case] overflow_at: Option<u16>) {
    let limits = ValidationLimits { max_operand_stack_depth: 4, ..Default::default() };
    let code = single_method("()V", |code| {
        code.ops(pushes);
        for &push in pushes.iter().rev() {
            code.op(if matches!(push, LCONST_0 | DCONST_0) { POP2 } else { POP });
        }
        code.op(RETURN);
    });
    assert_eq!(
        violation(&code, &limits),
        overflow_at.map(|depth| ShapeViolation::OperandStackOverflow { depth, limit: 4 })
    );
}

#[test]
fn test_rewritten_code_keeps_its_depth() {
    // A primitive array store needs three slots before and after rewriting.
    let limits = ValidationLimits { max_operand_stack_depth: 3, ..Default::default() };
    let code = single_method("()V", |code| {
        code.op(ICONST_1).newarray(T_INT).op(ICONST_0).op(ICONST_5).op(IASTORE).op(RETURN);
    });
    let unit = validate_and_rewrite(&code, &limits).unwrap();
    assert_eq!(unit.rewritten_instructions(), 2);
}

#[rstest]
#[case::static_at_ceiling("(JJ)V", true, None)]
#[case::static_past_ceiling("(JJI)V", true, Some(5))]
#[case::instance_at_ceiling("(JI)V", false, None)]
#[case::instance_past_ceiling("(JJ)V", false, Some(5))]
fn test_parameter_slots(
    #[case] descriptor: &str,
    #[case] is_static: bool,
    #[case] too_many: Option<u32>,
) {
    let limits = ValidationLimits { max_local_slots: 4, ..Default::default() };
    let class = ClassBuilder::new("Main");
    let class = if is_static {
        class.static_method("run", descriptor, |code| {
            code.op(RETURN);
        })
    } else {
        class.method("run", descriptor, |code| {
            code.op(RETURN);
        })
    };
    let code = ModuleBuilder::new("Main").class(class).encode();
    assert_eq!(
        violation(&code, &limits),
        too_many.map(|slots| ShapeViolation::TooManyLocals { slots, limit: 4 })
    );
}

#[rstest]
#[case::int_at_ceiling(ICONST_0, ISTORE, 3, None)]
#[case::int_past_ceiling(ICONST_0, ISTORE, 4, Some(5))]
#[case::long_at_ceiling(LCONST_0, LSTORE, 2, None)]
#[case::long_straddles_ceiling(LCONST_0, LSTORE, 3, Some(5))]
fn test_local_slots(
    #[case] push: u8,
    #[case] store: u8,
    #[case] index: u8,
    #[case] too_many: Option<u32>,
) {
    let limits = ValidationLimits { max_local_slots: 4, ..Default::default() };
    let code = single_method("()V", |code| {
        code.op(push).raw(&[store, index]).op(RETURN);
    });
    assert_eq!(
        violation(&code, &limits),
        too_many.map(|slots| ShapeViolation::TooManyLocals { slots, limit: 4 })
    );
}

#[test]
fn test_wide_local_index_counts() {
    let limits = ValidationLimits::default();
    let last = limits::MAX_LOCAL_SLOTS - 1;
    let at = single_method("()V", |code| {
        code.op(ICONST_0).istore(last).op(RETURN);
    });
    assert_eq!(violation(&at, &limits), None);

    let past = single_method("()V", |code| {
        code.op(ICONST_0).istore(last + 1).op(RETURN);
    });
    assert_eq!(
        violation(&past, &limits),
        Some(ShapeViolation::TooManyLocals {
            slots: limits::MAX_LOCAL_SLOTS as u32 + 1,
            limit: limits::MAX_LOCAL_SLOTS,
        })
    );
}

#[test]
fn test_class_count() {
    let limits = ValidationLimits { max_classes: 2, ..Default::default() };
    let module = |count: usize| {
        (1..count).fold(ModuleBuilder::new("Main").class(ClassBuilder::new("Main")), |m, i| {
            m.class(ClassBuilder::new(format!("Helper{i}")))
        })
    };
    assert!(validate_and_rewrite(&module(2).encode(), &limits).is_ok());
    assert_eq!(
        validate_and_rewrite(&module(3).encode(), &limits).unwrap_err(),
        StaticRejection::TooManyClasses { count: 3, limit: 2 }
    );
}

#[test]
fn test_structural_rejections() {
    let limits = ValidationLimits::default();

    let reserved = ModuleBuilder::new("avm/Main").class(ClassBuilder::new("avm/Main")).encode();
    assert_eq!(
        validate_and_rewrite(&reserved, &limits).unwrap_err(),
        StaticRejection::ReservedClassName { name: "avm/Main".into() }
    );

    let cyclic = ModuleBuilder::new("A")
        .class(ClassBuilder::new("A").extends("B"))
        .class(ClassBuilder::new("B").extends("A"))
        .encode();
    assert!(matches!(
        validate_and_rewrite(&cyclic, &limits),
        Err(StaticRejection::CyclicHierarchy { .. })
    ));

    let subroutine = single_method("()V", |code| {
        code.raw(&[JSR, 0, 3]).op(RETURN);
    });
    assert!(matches!(violation(&subroutine, &limits), Some(ShapeViolation::Decode(_))));

    assert!(matches!(
        validate_and_rewrite(b"not a module", &limits),
        Err(StaticRejection::Format(_))
    ));
}

#[test]
fn test_validation_is_deterministic_across_threads() {
    let code = single_method("(I)I", |code| {
        let exit = code.label();
        code.iload(0).branch(IFLE, exit).iload(0).iconst(3).op(IMUL).op(IRETURN);
        code.bind(exit).iconst(-1).op(IRETURN);
    });
    let limits = ValidationLimits::default();
    let reference = validate_and_rewrite(&code, &limits).unwrap();
    let units: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| validate_and_rewrite(&code, &limits).unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });
    for unit in units {
        assert_eq!(unit.hash(), reference.hash());
        assert_eq!(unit.classes(), reference.classes());
    }
}
