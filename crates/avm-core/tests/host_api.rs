//! Tests for the host-facing surface: entry point lookup, argument checks, deployment with class
//! initializers and configuration.

use std::sync::Arc;

use alloy_primitives::{address, Address, Bytes};
use avm_core::{
    bytecode::opcode::*,
    root_key, run_invocation,
    test_utils::{deployed, invoke, ClassBuilder, MemoryWorldState, ModuleBuilder, TEST_ENERGY},
    validate_and_rewrite, InstanceId, InvocationFailure, InvocationRequest, InvocationStatus,
    Sandbox, SandboxConfig, ValidationLimits, Value,
};
use rstest::rstest;

const CONTRACT: Address = address!("000000000000000000000000000000000000a91a");

fn host_module() -> Bytes {
    let main = ClassBuilder::new("Main")
        .static_field("answer", "I")
        .clinit(|code| {
            code.iconst(42).putstatic("Main", "answer", "I").op(RETURN);
        })
        .static_method("getAnswer", "()I", |code| {
            code.getstatic("Main", "answer", "I").op(IRETURN);
        })
        .static_method("echoByte", "(B)I", |code| {
            code.iload(0).op(IRETURN);
        })
        .static_method("addLong", "(JI)J", |code| {
            code.lload(0).iload(2).op(I2L).op(LADD).op(LRETURN);
        })
        .static_method("isNull", "([I)Z", |code| {
            let null = code.label();
            code.aload(0).branch(IFNULL, null).iconst(0).op(IRETURN);
            code.bind(null).iconst(1).op(IRETURN);
        })
        .method("instance", "()V", |code| {
            code.op(RETURN);
        })
        .default_constructor();
    let helper = ClassBuilder::new("Helper").static_method("run", "()V", |code| {
        code.op(RETURN);
    });
    ModuleBuilder::new("Main").class(main).class(helper).encode()
}

#[test]
fn test_class_initializers_run_at_deployment() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, host_module());
    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, "getAnswer", "()I", vec![]);
    assert_eq!(outcome.return_value, Some(Value::Int(42)));
}

#[test]
fn test_failing_initializer_aborts_deployment() {
    let main = ClassBuilder::new("Main").clinit(|code| {
        code.iconst(1).iconst(0).op(IDIV).op(POP).op(RETURN);
    });
    let code = ModuleBuilder::new("Main").class(main).encode();

    let mut sandbox = Sandbox::default();
    let mut world = MemoryWorldState::default();
    let outcome = sandbox.deploy(&mut world, CONTRACT, code, TEST_ENERGY).unwrap();
    assert_eq!(outcome.status, InvocationStatus::Revert);
    assert_eq!(
        outcome.failure,
        Some(InvocationFailure::Uncaught { class: "avm/ArithmeticException".into() })
    );
    assert_eq!(world, MemoryWorldState::default());
}

#[test]
fn test_arguments_are_checked_and_narrowed() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, host_module());
    let mut call = |method: &str, descriptor: &str, args: Vec<Value>| {
        invoke(&mut sandbox, &mut world, CONTRACT, method, descriptor, args)
    };

    assert_eq!(call("echoByte", "(B)I", vec![Value::Int(300)]).return_value, Some(Value::Int(44)));
    assert_eq!(
        call("addLong", "(JI)J", vec![Value::Long(1 << 40), Value::Int(-1)]).return_value,
        Some(Value::Long((1 << 40) - 1))
    );
    assert_eq!(call("isNull", "([I)Z", vec![Value::Ref(None)]).return_value, Some(Value::Int(1)));

    let mismatch = Some(InvocationFailure::ArgumentMismatch { descriptor: "(JI)J".into() });
    for args in [
        vec![Value::Long(1)],
        vec![Value::Int(1), Value::Int(1)],
        vec![Value::Long(1), Value::Int(1), Value::Int(1)],
    ] {
        let outcome = call("addLong", "(JI)J", args);
        assert_eq!(outcome.status, InvocationStatus::RejectedAtRuntime);
        assert_eq!(outcome.failure, mismatch);
    }

    // Hosts cannot hand in references to persisted objects.
    let outcome = call("isNull", "([I)Z", vec![Value::Ref(Some(InstanceId(1)))]);
    assert_eq!(
        outcome.failure,
        Some(InvocationFailure::ArgumentMismatch { descriptor: "([I)Z".into() })
    );
}

#[rstest]
#[case::unknown("missing", "()V")]
#[case::wrong_descriptor("getAnswer", "()J")]
#[case::instance_method("instance", "()V")]
#[case::constructor("<init>", "()V")]
#[case::initializer("<clinit>", "()V")]
#[case::other_class("run", "()V")]
fn test_entry_points_are_public_statics_of_main(#[case] method: &str, #[case] descriptor: &str) {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, host_module());
    let before = world.clone();

    let outcome = invoke(&mut sandbox, &mut world, CONTRACT, method, descriptor, vec![]);
    assert_eq!(outcome.status, InvocationStatus::RejectedAtRuntime);
    assert_eq!(
        outcome.failure,
        Some(InvocationFailure::NoEntryPoint { name: method.into(), descriptor: descriptor.into() })
    );
    assert_eq!(world, before);
}

#[test]
fn test_run_invocation_with_prepared_unit() {
    let code = host_module();
    let (_, mut world) = deployed(SandboxConfig::default(), CONTRACT, code.clone());
    let unit = Arc::new(validate_and_rewrite(&code, &ValidationLimits::default()).unwrap());

    let request = InvocationRequest::new(CONTRACT, "echoByte", "(B)I", TEST_ENERGY)
        .with_args(vec![Value::Int(-3)]);
    let outcome = run_invocation(&mut world, &unit, &request, &SandboxConfig::default());
    assert!(outcome.is_success());
    assert_eq!(outcome.return_value, Some(Value::Int(-3)));
    assert_eq!(outcome.root_state, world.storage_value(CONTRACT, &root_key()));
}

#[test]
fn test_validated_units_are_cached() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, host_module());
    assert_eq!(sandbox.units().len(), 1);

    for _ in 0..3 {
        let outcome = invoke(&mut sandbox, &mut world, CONTRACT, "getAnswer", "()I", vec![]);
        assert!(outcome.is_success());
    }
    assert_eq!(sandbox.units().len(), 1);
}

#[test]
fn test_config_deserializes_with_defaults() {
    let config: SandboxConfig = serde_json::from_str(
        r#"{
            "max_call_depth": 3,
            "limits": { "max_classes": 5 },
            "schedule": { "instruction": 2, "fixed_read": 10 }
        }"#,
    )
    .unwrap();

    let defaults = SandboxConfig::default();
    assert_eq!(config.max_call_depth, 3);
    assert_eq!(config.max_frame_depth, defaults.max_frame_depth);
    assert_eq!(config.limits, ValidationLimits { max_classes: 5, ..defaults.limits });
    assert_eq!(config.schedule.instruction, 2);
    assert_eq!(config.schedule.fixed_read, 10);
    assert_eq!(config.schedule.write_new, defaults.schedule.write_new);

    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(serde_json::from_str::<SandboxConfig>(&json).unwrap(), config);
    assert_eq!(serde_json::from_str::<SandboxConfig>("{}").unwrap(), defaults);
}
