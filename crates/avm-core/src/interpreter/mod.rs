//! # Interpreter
//!
//! Executes rewritten code against a contract's lazily loaded heap.
//!
//! Each contract activation runs an explicit frame stack, so deep call chains inside one
//! contract never grow the host stack; the frame count is capped by
//! [`SandboxConfig::max_frame_depth`]. Every instruction is charged before it runs.
//!
//! Capability violations (null dereference, bad index, failed cast, division by zero) are
//! materialized as instances of the built-in exception classes and unwind through the
//! contract's own handlers. An exception that escapes the entry point reverts the invocation.
//!
//! ## Cross-contract calls
//!
//! A call to another contract runs its entry point on a child ledger limited to the caller's
//! remaining budget. Before the call the active heaps and the storage journal are
//! snapshotted; if the callee fails, both are rolled back along with any reclamation credits
//! the callee earned, and the caller sees an `avm/CallFailedException`. Running out of energy
//! and unreadable persisted state or storage end the whole invocation instead. A contract
//! re-entered while already active shares its heap with the outer activation, and only the
//! outermost activation commits.

mod exec;
mod frame;
mod outcome;

pub use outcome::*;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use alloy_primitives::{Address, Bytes};
use tracing::{debug, trace};

use self::{
    exec::{class_name, step, Env, Fault, Step},
    frame::Frame,
};
use crate::{
    builtins,
    persistence::{CommitReport, Heap, ObjectBody},
    sandbox::{SandboxConfig, UnitCache},
    storage::{Checkpoint, StorageOverlay, WorldState},
    unit::{ClassTarget, CodeUnit, MethodHandle, PoolTarget},
    ClassId, EnergyCharge, EnergyLedger, InstanceId, Value, ValueKind,
};

/// Checks arguments against an entry point's parameters and narrows sub-int values. Unless
/// `references` is set, reference parameters only accept `null`.
pub(crate) fn check_arguments(
    unit: &CodeUnit,
    entry: MethodHandle,
    args: Vec<Value>,
    references: bool,
) -> Result<Vec<Value>, InvocationFailure> {
    let method = unit.method(entry).ok_or(InvocationFailure::OperandMismatch { at: 0 })?;
    let mismatch =
        || InvocationFailure::ArgumentMismatch { descriptor: method.descriptor.clone() };
    if args.len() != method.signature.params.len() {
        return Err(mismatch());
    }
    method
        .signature
        .params
        .iter()
        .zip(args)
        .map(|(&kind, arg)| {
            let value_kind = kind.value_kind();
            let valid = arg.kind() == value_kind &&
                (references || value_kind != ValueKind::Reference || arg.referent().is_none());
            valid.then(|| arg.narrow(kind)).ok_or_else(mismatch)
        })
        .collect()
}

/// State rolled back when a cross-contract call fails.
struct Snapshot {
    heaps: BTreeMap<Address, Heap>,
    destroyed: BTreeSet<Address>,
    checkpoint: Checkpoint,
}

/// Runs contract code over a storage overlay.
#[derive(Debug)]
pub(crate) struct Machine<'c, S> {
    overlay: StorageOverlay<S>,
    config: &'c SandboxConfig,
    units: &'c mut UnitCache,
    /// Heaps of the contracts with a live activation.
    heaps: BTreeMap<Address, Heap>,
    /// Contracts that called `selfDestruct` during their live activation.
    destroyed: BTreeSet<Address>,
    /// Root records as of each contract's latest commit.
    roots: BTreeMap<Address, Bytes>,
    /// Nesting of cross-contract calls.
    depth: usize,
}

impl<'c, S: WorldState> Machine<'c, S> {
    pub(crate) fn new(state: S, config: &'c SandboxConfig, units: &'c mut UnitCache) -> Self {
        Self {
            overlay: StorageOverlay::new(state),
            config,
            units,
            heaps: BTreeMap::new(),
            destroyed: BTreeSet::new(),
            roots: BTreeMap::new(),
            depth: 0,
        }
    }

    /// The buffered writes of everything run so far.
    pub(crate) fn into_overlay(self) -> StorageOverlay<S> {
        self.overlay
    }

    pub(crate) fn overlay_mut(&mut self) -> &mut StorageOverlay<S> {
        &mut self.overlay
    }

    /// The root record a contract committed during this run, if any.
    pub(crate) fn committed_root(&self, address: Address) -> Option<Bytes> {
        self.roots.get(&address).cloned()
    }

    /// Runs a method as an activation of `address`, opening the contract's heap unless it is
    /// already active, and committing it when the outermost activation returns.
    pub(crate) fn activate(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        unit: &Arc<CodeUnit>,
        entry: MethodHandle,
        args: Vec<Value>,
    ) -> Result<Option<Value>, InvocationFailure> {
        let outermost = !self.heaps.contains_key(&address);
        if outermost {
            let heap = Heap::open(address, unit.registry().clone(), &mut self.overlay, ledger)?;
            self.heaps.insert(address, heap);
        }
        let result = self.run(ledger, address, unit, entry, args);
        if !outermost {
            return result;
        }
        let heap = self.heaps.remove(&address);
        let value = result?;
        if let Some(heap) = heap {
            self.finish(ledger, heap)?;
        }
        Ok(value)
    }

    /// Runs every class initializer of a freshly deployed unit on an empty heap, then commits
    /// the heap, writing the contract's first root record.
    pub(crate) fn initialize(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        unit: &Arc<CodeUnit>,
    ) -> Result<(), InvocationFailure> {
        self.heaps.insert(address, Heap::create(address, unit.registry().clone()));
        for initializer in unit.initializers() {
            if let Err(failure) = self.run(ledger, address, unit, initializer, Vec::new()) {
                self.heaps.remove(&address);
                return Err(failure);
            }
        }
        match self.heaps.remove(&address) {
            Some(heap) => self.finish(ledger, heap),
            None => Ok(()),
        }
    }

    /// Opens a contract's heap and commits it unchanged, reclaiming whatever is no longer
    /// reachable.
    pub(crate) fn collect(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        unit: &Arc<CodeUnit>,
    ) -> Result<CommitReport, InvocationFailure> {
        let mut heap = Heap::open(address, unit.registry().clone(), &mut self.overlay, ledger)?;
        let report = heap.commit(&mut self.overlay, ledger)?;
        self.roots.insert(address, heap.root_state());
        Ok(report)
    }

    fn finish(
        &mut self,
        ledger: &mut EnergyLedger,
        mut heap: Heap,
    ) -> Result<(), InvocationFailure> {
        let address = heap.address();
        if self.destroyed.remove(&address) {
            heap.destroy(&mut self.overlay);
            self.overlay.put_code(address, Bytes::new());
            self.roots.insert(address, Bytes::new());
            debug!(target: "avm::interpreter", %address, "Contract self-destructed");
            return Ok(());
        }
        heap.commit(&mut self.overlay, ledger)?;
        self.roots.insert(address, heap.root_state());
        Ok(())
    }

    /// Calls another contract's entry point, rolling back its effects if it fails.
    fn call_contract(
        &mut self,
        ledger: &mut EnergyLedger,
        caller: Address,
        callee: Address,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, InvocationFailure> {
        let foreign = callee != caller;
        if foreign && args.iter().any(|arg| arg.referent().is_some()) {
            return Err(InvocationFailure::ForeignReference { address: callee });
        }
        if self.depth >= self.config.max_call_depth {
            return Err(InvocationFailure::CallDepthExceeded { limit: self.config.max_call_depth });
        }

        let snapshot = Snapshot {
            heaps: self.heaps.clone(),
            destroyed: self.destroyed.clone(),
            checkpoint: self.overlay.checkpoint(),
        };
        let mut child = ledger.child();
        self.depth += 1;
        let result = self.enter_contract(&mut child, callee, name, descriptor, args, !foreign);
        self.depth -= 1;

        let result = result.and_then(|value| match value {
            Some(value) if foreign && value.referent().is_some() => {
                Err(InvocationFailure::ForeignReference { address: callee })
            }
            value => Ok(value),
        });
        match &result {
            Ok(_) => ledger.fold(&child),
            Err(failure) => {
                debug!(target: "avm::interpreter", %caller, %callee, %failure, "Call failed");
                // The callee's commit is undone, and with it the reclamations it was credited for.
                ledger.fold_debits(&child);
                self.heaps = snapshot.heaps;
                self.destroyed = snapshot.destroyed;
                self.overlay.revert_to(snapshot.checkpoint);
            }
        }
        result
    }

    fn enter_contract(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
        references: bool,
    ) -> Result<Option<Value>, InvocationFailure> {
        let code = self.overlay.code(address)?;
        ledger.charge(EnergyCharge::StorageRead { bytes: code.len() as u64 })?;
        if code.is_empty() {
            return Err(InvocationFailure::NoCode { address });
        }
        let unit = self.units.load(&code, &self.config.limits)?;
        let entry = unit.entry_point(name, descriptor).ok_or_else(|| {
            InvocationFailure::NoEntryPoint {
                name: name.to_owned(),
                descriptor: descriptor.to_owned(),
            }
        })?;
        let args = check_arguments(&unit, entry, args, references)?;
        trace!(
            target: "avm::interpreter",
            %address,
            name,
            descriptor,
            depth = self.depth,
            "Entering contract"
        );
        self.activate(ledger, address, &unit, entry, args)
    }

    /// The frame loop of one activation.
    fn run(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        unit: &Arc<CodeUnit>,
        entry: MethodHandle,
        args: Vec<Value>,
    ) -> Result<Option<Value>, InvocationFailure> {
        let mut frames = vec![self.frame(unit, entry, args)?];
        loop {
            let Some(frame) = frames.last_mut() else {
                return Ok(None);
            };
            let at = frame.pc;
            let (Some(method), Some(class)) =
                (unit.method(frame.method), unit.class(frame.method.class))
            else {
                return Err(InvocationFailure::OperandMismatch { at });
            };
            let insn = *method
                .code
                .instructions
                .get(at)
                .ok_or(InvocationFailure::OperandMismatch { at })?;
            ledger.charge(EnergyCharge::Instruction)?;

            let heap =
                self.heaps.get_mut(&address).ok_or(InvocationFailure::OperandMismatch { at })?;
            let overlay = &mut self.overlay;
            let mut env = Env { unit, class, heap, overlay, ledger: &mut *ledger };
            let thrown = match step(&mut env, frame, insn) {
                Ok(Step::Next) => {
                    frame.pc += 1;
                    continue;
                }
                Ok(Step::Jump(target)) => {
                    frame.pc = target;
                    continue;
                }
                Ok(Step::Invoke { method, args }) => {
                    if frames.len() >= self.config.max_frame_depth {
                        return Err(InvocationFailure::FrameDepthExceeded {
                            limit: self.config.max_frame_depth,
                        });
                    }
                    frames.push(self.frame(unit, method, args)?);
                    continue;
                }
                Ok(Step::Return(value)) => {
                    frames.pop();
                    match frames.last_mut() {
                        None => return Ok(value),
                        Some(caller) => {
                            caller.stack.extend(value);
                            caller.pc += 1;
                        }
                    }
                    continue;
                }
                Ok(Step::SelfDestruct) => {
                    self.destroyed.insert(address);
                    frame.pc += 1;
                    continue;
                }
                Ok(Step::Call { address: callee, name, descriptor, args }) => {
                    match self.call_contract(ledger, address, callee, &name, &descriptor, args) {
                        Ok(value) => {
                            frame.stack.extend(value);
                            frame.pc += 1;
                            continue;
                        }
                        Err(failure) if failure.is_fatal() => return Err(failure),
                        Err(_) if ledger.is_exhausted() => return Err(ledger.exhaust().into()),
                        Err(_) => {
                            let class = builtins::CALL_FAILED_EXCEPTION;
                            self.materialize(ledger, address, unit, class)?
                        }
                    }
                }
                Err(Fault::Throw(id)) => id,
                Err(Fault::Violation(violation)) => {
                    trace!(target: "avm::interpreter", at, %violation, "Capability violation");
                    self.materialize(ledger, address, unit, violation.exception_class())?
                }
                Err(Fault::Abort(failure)) => return Err(failure),
            };
            self.unwind(address, unit, &mut frames, thrown)?;
        }
    }

    fn frame(
        &self,
        unit: &CodeUnit,
        method: MethodHandle,
        args: Vec<Value>,
    ) -> Result<Frame, InvocationFailure> {
        let linked = unit.method(method).ok_or(InvocationFailure::OperandMismatch { at: 0 })?;
        if linked.is_abstract() {
            return Err(InvocationFailure::AbstractMethod {
                name: linked.name.clone(),
                descriptor: linked.descriptor.clone(),
            });
        }
        Ok(Frame::new(method, linked.code.max_locals, args))
    }

    /// Allocates a built-in exception on the running contract's heap.
    fn materialize(
        &mut self,
        ledger: &mut EnergyLedger,
        address: Address,
        unit: &CodeUnit,
        class_name: &str,
    ) -> Result<InstanceId, InvocationFailure> {
        let missing = InvocationFailure::OperandMismatch { at: 0 };
        let heap = self.heaps.get_mut(&address).ok_or(missing.clone())?;
        let class = unit.class(ClassId::OBJECT).ok_or(missing.clone())?;
        let mut env = Env { unit, class, heap, overlay: &mut self.overlay, ledger: &mut *ledger };
        match env.new_exception(class_name) {
            Ok(id) => Ok(id),
            Err(Fault::Abort(failure)) => Err(failure),
            Err(_) => Err(missing),
        }
    }

    /// Transfers control to the innermost handler covering the throwing instruction, popping
    /// frames until one is found.
    fn unwind(
        &mut self,
        address: Address,
        unit: &CodeUnit,
        frames: &mut Vec<Frame>,
        exception: InstanceId,
    ) -> Result<(), InvocationFailure> {
        let thrown = match self.heaps.get(&address).and_then(|heap| heap.object(exception)) {
            Some(object) => match object.body {
                ObjectBody::Instance { class, .. } => class,
                ObjectBody::Container(_) => {
                    return Err(InvocationFailure::OperandMismatch { at: 0 })
                }
            },
            None => return Err(InvocationFailure::OperandMismatch { at: 0 }),
        };
        while let Some(frame) = frames.last_mut() {
            let (Some(method), Some(class)) =
                (unit.method(frame.method), unit.class(frame.method.class))
            else {
                return Err(InvocationFailure::OperandMismatch { at: frame.pc });
            };
            let handler = method.code.handlers.iter().find(|handler| {
                handler.covers(frame.pc) &&
                    (handler.catch_type == 0 ||
                        matches!(
                            class.pool_entry(handler.catch_type),
                            PoolTarget::Class(ClassTarget::Type(caught))
                                if unit.registry().is_subtype(thrown, *caught)
                        ))
            });
            if let Some(handler) = handler {
                trace!(
                    target: "avm::interpreter",
                    %exception,
                    handler = handler.handler,
                    "Exception caught"
                );
                frame.stack.clear();
                frame.push(Value::Ref(Some(exception)));
                frame.pc = handler.handler;
                return Ok(());
            }
            frames.pop();
        }
        let class = class_name(unit, thrown);
        debug!(target: "avm::interpreter", %address, %class, "Uncaught exception");
        Err(InvocationFailure::Uncaught { class })
    }
}
