use alloy_primitives::{Address, Bytes};

use crate::{InvocationOutcome, InvocationRequest, InvocationStatus, Sandbox, SandboxConfig, Value};

use super::MemoryWorldState;

/// An energy budget large enough for any test contract.
pub const TEST_ENERGY: u64 = 1_000_000_000;

/// Deploys `code` at `address` into a fresh world state, asserting that deployment succeeds.
pub fn deployed(
    config: SandboxConfig,
    address: Address,
    code: Bytes,
) -> (Sandbox, MemoryWorldState) {
    let mut sandbox = Sandbox::new(config);
    let mut world = MemoryWorldState::default();
    deploy_into(&mut sandbox, &mut world, address, code);
    (sandbox, world)
}

/// Deploys `code` at `address` into `world`, asserting that deployment succeeds.
pub fn deploy_into(
    sandbox: &mut Sandbox,
    world: &mut MemoryWorldState,
    address: Address,
    code: Bytes,
) -> InvocationOutcome {
    let outcome =
        sandbox.deploy(&mut *world, address, code, TEST_ENERGY).expect("module is valid");
    assert_eq!(outcome.status, InvocationStatus::Success, "deployment failed: {outcome:?}");
    outcome
}

/// Calls `method` of the contract at `address` with the test budget.
pub fn invoke(
    sandbox: &mut Sandbox,
    world: &mut MemoryWorldState,
    address: Address,
    method: &str,
    descriptor: &str,
    args: Vec<Value>,
) -> InvocationOutcome {
    let request = InvocationRequest::new(address, method, descriptor, TEST_ENERGY).with_args(args);
    sandbox.call(&mut *world, &request)
}
