//! Tests for energy metering: exact budgets, exhaustion and the prices of individual events.

use alloy_primitives::{address, Address, Bytes};
use avm_core::{
    bytecode::opcode::*,
    constants::energy,
    test_utils::{deployed, ClassBuilder, MemoryWorldState, ModuleBuilder},
    EnergySchedule, InvocationFailure, InvocationOutcome, InvocationRequest, InvocationStatus,
    ResourceExhaustion, Sandbox, SandboxConfig, Value,
};

const CONTRACT: Address = address!("00000000000000000000000000000000000e4e4e");

/// Root record size of the module below: counters, live count and the `x` static.
const ROOT_LEN: u64 = 8 + 4 + 4 + 4;

fn metered_module() -> Bytes {
    let main = ClassBuilder::new("Main")
        .static_field("x", "I")
        .static_method("get", "()I", |code| {
            code.getstatic("Main", "x", "I").op(IRETURN);
        })
        .static_method("spin", "()V", |code| {
            let top = code.here();
            code.branch(GOTO, top);
        })
        .static_method("writeThenSpin", "()V", |code| {
            code.iconst(1).putstatic("Main", "x", "I");
            let top = code.here();
            code.branch(GOTO, top);
        })
        .static_method("remaining", "()J", |code| {
            code.native("remainingEnergy", "()J").op(LRETURN);
        })
        .static_method("allocate", "()V", |code| {
            code.iconst(4).newarray(T_LONG).op(POP).op(RETURN);
        })
        .static_method("recurse", "()V", |code| {
            code.invokestatic("Main", "recurse", "()V").op(RETURN);
        });
    ModuleBuilder::new("Main").class(main).encode()
}

fn call(
    sandbox: &mut Sandbox,
    world: &mut MemoryWorldState,
    method: &str,
    descriptor: &str,
    limit: u64,
) -> InvocationOutcome {
    sandbox.call(&mut *world, &InvocationRequest::new(CONTRACT, method, descriptor, limit))
}

#[test]
fn test_exact_budget_passes() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, metered_module());
    // Root read plus two instructions.
    let cost = energy::FIXED_READ_COST + ROOT_LEN + 2;

    let exact = call(&mut sandbox, &mut world, "get", "()I", cost);
    assert_eq!(exact.status, InvocationStatus::Success);
    assert_eq!(exact.energy_used, cost as i64);

    let short = call(&mut sandbox, &mut world, "get", "()I", cost - 1);
    assert_eq!(short.status, InvocationStatus::OutOfResources);
    assert_eq!(short.energy_used, (cost - 1) as i64);
    assert_eq!(
        short.failure,
        Some(InvocationFailure::Exhausted(ResourceExhaustion { limit: cost - 1, required: cost }))
    );
}

#[test]
fn test_exhaustion_discards_everything() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, metered_module());
    let before = world.clone();

    for method in ["spin", "writeThenSpin"] {
        let outcome = call(&mut sandbox, &mut world, method, "()V", 100_000);
        assert_eq!(outcome.status, InvocationStatus::OutOfResources);
        assert_eq!(outcome.energy_used, 100_000);
        assert!(outcome.usage.gross() <= 100_000);
        assert_eq!(outcome.return_value, None);
        assert_eq!(world, before);
    }
}

#[test]
fn test_budget_below_root_read() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, metered_module());

    let outcome = call(&mut sandbox, &mut world, "get", "()I", 100);
    assert_eq!(outcome.status, InvocationStatus::OutOfResources);
    assert_eq!(outcome.energy_used, 100);
    // The refused read is not recorded.
    assert_eq!(outcome.usage, Default::default());
}

#[test]
fn test_remaining_energy_native() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, metered_module());
    let limit = 1_000_000;

    let outcome = call(&mut sandbox, &mut world, "remaining", "()J", limit);
    assert!(outcome.is_success());
    // Everything but the return instruction is charged before the native reads the ledger.
    let expected = limit as i64 - outcome.energy_used + energy::INSTRUCTION_COST as i64;
    assert_eq!(outcome.return_value, Some(Value::Long(expected)));
    assert_eq!(outcome.usage.compute, 2 * energy::INSTRUCTION_COST + energy::NATIVE_COST);
}

#[test]
fn test_allocation_pricing() {
    let (mut sandbox, mut world) = deployed(SandboxConfig::default(), CONTRACT, metered_module());

    let outcome = call(&mut sandbox, &mut world, "allocate", "()V", 1_000_000);
    assert!(outcome.is_success());
    assert_eq!(
        outcome.usage.compute,
        4 * energy::INSTRUCTION_COST +
            energy::ALLOCATION_BASE_COST +
            4 * energy::ALLOCATION_PER_ELEMENT_COST
    );
    // The container is dropped; only the allocation counters in the root change.
    assert_eq!(outcome.usage.storage_write, energy::PER_OBJECT_WRITE_UPDATE + ROOT_LEN);
}

#[test]
fn test_schedule_is_configurable() {
    let schedule = EnergySchedule { instruction: 7, fixed_read: 100, ..Default::default() };
    let config = SandboxConfig { schedule, ..Default::default() };
    let (mut sandbox, mut world) = deployed(config, CONTRACT, metered_module());

    let outcome = call(&mut sandbox, &mut world, "get", "()I", 1_000_000);
    assert_eq!(outcome.usage.compute, 14);
    assert_eq!(outcome.usage.storage_read, 100 + ROOT_LEN);
}

#[test]
fn test_frame_depth_limit() {
    let config = SandboxConfig { max_frame_depth: 8, ..Default::default() };
    let (mut sandbox, mut world) = deployed(config, CONTRACT, metered_module());

    let outcome = call(&mut sandbox, &mut world, "recurse", "()V", 1_000_000);
    assert_eq!(outcome.status, InvocationStatus::Revert);
    assert_eq!(outcome.failure, Some(InvocationFailure::FrameDepthExceeded { limit: 8 }));
}

#[test]
fn test_code_deposit_is_metered() {
    let code = metered_module();
    let cost = energy::CODE_DEPOSIT_BYTE_COST * code.len() as u64 +
        energy::PER_OBJECT_WRITE_NEW +
        ROOT_LEN;

    let mut sandbox = Sandbox::default();
    let mut world = MemoryWorldState::default();
    let short = sandbox.deploy(&mut world, CONTRACT, code.clone(), cost - 1).unwrap();
    assert_eq!(short.status, InvocationStatus::OutOfResources);
    assert_eq!(world, MemoryWorldState::default());

    let exact = sandbox.deploy(&mut world, CONTRACT, code.clone(), cost).unwrap();
    assert_eq!(exact.status, InvocationStatus::Success);
    assert_eq!(exact.energy_used, cost as i64);
    assert_eq!(world.code_of(CONTRACT), code);
}
