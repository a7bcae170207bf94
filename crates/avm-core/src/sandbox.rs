//! The host-facing entry points.
//!
//! [`run_invocation`] runs one entry point of an already validated [`CodeUnit`] against a world
//! state and reports the outcome. [`Sandbox`] wraps it with deployment, code loading and a
//! cache of validated units.

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{keccak256, Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    constants::limits,
    interpreter::{check_arguments, InvocationFailure, InvocationOutcome, InvocationStatus, Machine},
    storage::{root_key, WorldState},
    unit::{validate_and_rewrite, CodeUnit},
    EnergyCharge, EnergyLedger, EnergySchedule, StaticRejection, StorageError, ValidationLimits,
    Value,
};

/// Everything that parameterizes the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deployment-time ceilings.
    pub limits: ValidationLimits,
    /// Energy prices.
    pub schedule: EnergySchedule,
    /// Maximum nesting of cross-contract calls.
    pub max_call_depth: usize,
    /// Maximum live frames in one contract activation.
    pub max_frame_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ValidationLimits::default(),
            schedule: EnergySchedule::default(),
            max_call_depth: limits::MAX_CALL_DEPTH,
            max_frame_depth: limits::MAX_FRAME_DEPTH,
        }
    }
}

/// Validated code units by module hash.
#[derive(Debug, Default)]
pub struct UnitCache {
    units: HashMap<B256, Arc<CodeUnit>>,
}

impl UnitCache {
    /// Adds an already validated unit.
    pub fn insert(&mut self, unit: Arc<CodeUnit>) {
        self.units.insert(unit.hash(), unit);
    }

    /// Returns the unit built from `code`, validating it on first use.
    pub fn load(
        &mut self,
        code: &[u8],
        limits: &ValidationLimits,
    ) -> Result<Arc<CodeUnit>, StaticRejection> {
        let hash = keccak256(code);
        if let Some(unit) = self.units.get(&hash) {
            return Ok(unit.clone());
        }
        let unit = Arc::new(validate_and_rewrite(code, limits)?);
        debug!(target: "avm::sandbox", %hash, "Cached code unit");
        self.units.insert(hash, unit.clone());
        Ok(unit)
    }

    /// Number of cached units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// A call of a contract entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// The contract.
    pub address: Address,
    /// Name of a public static method of the main class.
    pub method: String,
    /// Its descriptor.
    pub descriptor: String,
    /// Arguments, one value per parameter.
    pub args: Vec<Value>,
    /// The energy budget.
    pub energy_limit: u64,
}

impl InvocationRequest {
    /// A request with no arguments.
    pub fn new(
        address: Address,
        method: impl Into<String>,
        descriptor: impl Into<String>,
        energy_limit: u64,
    ) -> Self {
        Self {
            address,
            method: method.into(),
            descriptor: descriptor.into(),
            args: Vec::new(),
            energy_limit,
        }
    }

    /// Sets the arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// The root record of `address` as stored in `state`.
fn stored_root<S: WorldState>(state: &mut S, address: Address) -> Result<Bytes, InvocationFailure> {
    state.storage(address, &root_key()).map_err(|e| StorageError(e.to_string()).into())
}

/// Flushes or discards the machine's writes and assembles the outcome.
///
/// A failed invocation keeps none of its reclamations, so it forfeits their credits.
fn conclude<S: WorldState>(
    machine: Machine<'_, S>,
    ledger: &mut EnergyLedger,
    address: Address,
    result: Result<Option<Value>, InvocationFailure>,
) -> InvocationOutcome {
    let committed = machine.committed_root(address);
    let overlay = machine.into_overlay();
    let (result, root_state) = match result {
        Ok(value) => match overlay.flush() {
            Ok(mut state) => match committed.map_or_else(|| stored_root(&mut state, address), Ok) {
                Ok(root) => (Ok(value), root),
                Err(failure) => (Err(failure), Bytes::new()),
            },
            Err(error) => (Err(error.into()), Bytes::new()),
        },
        Err(failure) => match stored_root(&mut overlay.discard(), address) {
            Ok(root) => (Err(failure), root),
            Err(error) => (Err(error), Bytes::new()),
        },
    };
    let outcome = match result {
        Ok(return_value) => InvocationOutcome {
            status: InvocationStatus::Success,
            energy_used: ledger.energy_used(),
            usage: *ledger.usage(),
            return_value,
            root_state,
            failure: None,
        },
        Err(failure) => {
            ledger.forfeit_credits();
            InvocationOutcome {
                status: failure.status(),
                energy_used: ledger.energy_used(),
                usage: *ledger.usage(),
                return_value: None,
                root_state,
                failure: Some(failure),
            }
        }
    };
    info!(
        target: "avm::sandbox",
        %address,
        status = %outcome.status,
        energy_used = outcome.energy_used,
        failure = ?outcome.failure,
        "Invocation finished"
    );
    outcome
}

/// Runs one entry point of `unit`, deployed at `request.address`, against `state`.
///
/// On success every buffered write is flushed to `state`; otherwise nothing is written. Calls
/// into other contracts load and validate their code from `state`.
pub fn run_invocation<S: WorldState>(
    state: S,
    unit: &Arc<CodeUnit>,
    request: &InvocationRequest,
    config: &SandboxConfig,
) -> InvocationOutcome {
    let mut units = UnitCache::default();
    units.insert(unit.clone());
    invoke(state, &mut units, unit, request, config)
}

fn invoke<S: WorldState>(
    state: S,
    units: &mut UnitCache,
    unit: &Arc<CodeUnit>,
    request: &InvocationRequest,
    config: &SandboxConfig,
) -> InvocationOutcome {
    let mut ledger = EnergyLedger::new(request.energy_limit, config.schedule);
    let mut machine = Machine::new(state, config, units);
    let result = unit
        .entry_point(&request.method, &request.descriptor)
        .ok_or_else(|| InvocationFailure::NoEntryPoint {
            name: request.method.clone(),
            descriptor: request.descriptor.clone(),
        })
        .and_then(|entry| {
            let args = check_arguments(unit, entry, request.args.clone(), false)?;
            machine.activate(&mut ledger, request.address, unit, entry, args)
        });
    conclude(machine, &mut ledger, request.address, result)
}

/// A sandbox instance: configuration plus a cache of validated code.
#[derive(Debug, Default)]
pub struct Sandbox {
    config: SandboxConfig,
    units: UnitCache,
}

impl Sandbox {
    /// Creates a sandbox.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config, units: UnitCache::default() }
    }

    /// The configuration.
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Validated units cached so far.
    pub const fn units(&self) -> &UnitCache {
        &self.units
    }

    /// Validates `code`, stores it at `address` and runs the class initializers, committing
    /// the contract's initial object graph.
    ///
    /// A module that fails validation is refused before anything is charged or written.
    pub fn deploy<S: WorldState>(
        &mut self,
        state: S,
        address: Address,
        code: Bytes,
        energy_limit: u64,
    ) -> Result<InvocationOutcome, StaticRejection> {
        let unit = self.units.load(&code, &self.config.limits)?;
        let mut ledger = EnergyLedger::new(energy_limit, self.config.schedule);
        let mut machine = Machine::new(state, &self.config, &mut self.units);
        let result = deploy_unit(&mut machine, &mut ledger, address, code, &unit);
        Ok(conclude(machine, &mut ledger, address, result))
    }

    /// Calls an entry point of a deployed contract.
    pub fn call<S: WorldState>(
        &mut self,
        mut state: S,
        request: &InvocationRequest,
    ) -> InvocationOutcome {
        let unit = match self.load(&mut state, request.address) {
            Ok(unit) => unit,
            Err(failure) => {
                let mut ledger = EnergyLedger::new(request.energy_limit, self.config.schedule);
                let machine = Machine::new(state, &self.config, &mut self.units);
                return conclude(machine, &mut ledger, request.address, Err(failure));
            }
        };
        invoke(state, &mut self.units, &unit, request, &self.config)
    }

    /// Walks a contract's persisted graph and reclaims every object no longer reachable from
    /// its statics, crediting the ledger once per reclaimed object.
    pub fn collect_garbage<S: WorldState>(
        &mut self,
        mut state: S,
        address: Address,
        energy_limit: u64,
    ) -> InvocationOutcome {
        let mut ledger = EnergyLedger::new(energy_limit, self.config.schedule);
        let unit = self.load(&mut state, address);
        let mut machine = Machine::new(state, &self.config, &mut self.units);
        let result = unit.and_then(|unit| {
            let report = machine.collect(&mut ledger, address, &unit)?;
            debug!(target: "avm::sandbox", %address, reclaimed = report.reclaimed, "Collected");
            Ok(None)
        });
        conclude(machine, &mut ledger, address, result)
    }

    fn load<S: WorldState>(
        &mut self,
        state: &mut S,
        address: Address,
    ) -> Result<Arc<CodeUnit>, InvocationFailure> {
        let code = state.code(address).map_err(|e| StorageError(e.to_string()))?;
        if code.is_empty() {
            return Err(InvocationFailure::NoCode { address });
        }
        Ok(self.units.load(&code, &self.config.limits)?)
    }
}

fn deploy_unit<S: WorldState>(
    machine: &mut Machine<'_, S>,
    ledger: &mut EnergyLedger,
    address: Address,
    code: Bytes,
    unit: &Arc<CodeUnit>,
) -> Result<Option<Value>, InvocationFailure> {
    if !machine.overlay_mut().code(address)?.is_empty() {
        return Err(InvocationFailure::AddressOccupied { address });
    }
    ledger.charge(EnergyCharge::CodeDeposit { bytes: code.len() as u64 })?;
    machine.overlay_mut().put_code(address, code);
    machine.initialize(ledger, address, unit)?;
    info!(target: "avm::sandbox", %address, hash = %unit.hash(), "Contract deployed");
    Ok(None)
}
