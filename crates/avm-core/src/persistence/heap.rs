use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use alloy_primitives::{Address, Bytes};
use tracing::{debug, trace};

use super::{HeapObject, ObjectBody, PersistenceError, RootRecord};
use crate::{
    storage::{instance_key, root_key, StorageOverlay, WorldState},
    EnergyCharge, EnergyLedger, InstanceId, SplitBoundary, StreamCorruption, TypeRegistry, Value,
};

#[derive(Debug, Clone)]
enum Slot {
    /// Known to exist, record not read yet.
    Stub,
    /// In memory. `persisted` holds the record bytes as last read or written, `None` for an
    /// object allocated during this activation.
    Loaded { object: HeapObject, persisted: Option<Bytes> },
}

/// What a commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Instances reachable from the statics.
    pub reachable: usize,
    /// Records written for the first time.
    pub written_new: usize,
    /// Records overwritten with different bytes.
    pub written_updated: usize,
    /// Previously persisted instances found unreachable and tombstoned.
    pub reclaimed: usize,
    /// Whether the root record changed.
    pub root_written: bool,
}

/// One contract's object graph while the contract is active.
///
/// Objects are keyed by their stable [`InstanceId`]. A reference decoded from a record only
/// creates a stub; the referenced record is read, and billed, the first time the object is
/// touched.
#[derive(Debug, Clone)]
pub struct Heap {
    address: Address,
    registry: Arc<TypeRegistry>,
    slots: BTreeMap<InstanceId, Slot>,
    root: RootRecord,
    persisted_root: Option<Bytes>,
    destroyed: bool,
}

impl Heap {
    /// The heap of a contract being deployed: no objects, zeroed statics, no root record yet.
    pub fn create(address: Address, registry: Arc<TypeRegistry>) -> Self {
        let root = RootRecord::fresh(&registry);
        Self {
            address,
            registry,
            slots: BTreeMap::new(),
            root,
            persisted_root: None,
            destroyed: false,
        }
    }

    /// Opens a deployed contract's heap by reading its root record.
    pub fn open<S: WorldState>(
        address: Address,
        registry: Arc<TypeRegistry>,
        overlay: &mut StorageOverlay<S>,
        ledger: &mut EnergyLedger,
    ) -> Result<Self, PersistenceError> {
        let bytes = overlay.storage(address, &root_key())?;
        ledger.charge(EnergyCharge::StorageRead { bytes: bytes.len() as u64 })?;
        if bytes.is_empty() {
            return Err(StreamCorruption::MissingRoot.into());
        }
        let root = RootRecord::decode(&bytes, &registry)?;
        let slots = root.references().map(|id| (id, Slot::Stub)).collect();
        trace!(target: "avm::persistence", %address, live = root.live.len(), "Opened heap");
        Ok(Self {
            address,
            registry,
            slots,
            root,
            persisted_root: Some(bytes),
            destroyed: false,
        })
    }

    /// The owning contract.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The type registry records are decoded against.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Whether the contract destroyed itself during this activation.
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The value of a static field.
    pub fn static_value(&self, slot: usize) -> Option<Value> {
        self.root.statics.get(slot).copied()
    }

    /// Writes a static field. Any referenced object is already on the heap.
    pub fn set_static(&mut self, slot: usize, value: Value) {
        if let Some(current) = self.root.statics.get_mut(slot) {
            *current = value;
        }
    }

    /// Places a new object on the heap, assigning it the next id and identity hash.
    pub fn allocate(&mut self, body: ObjectBody) -> InstanceId {
        let id = InstanceId(self.root.next_id);
        self.root.next_id += 1;
        let identity_hash = self.root.next_hash;
        self.root.next_hash = identity_hash.wrapping_add(1);
        self.slots.insert(
            id,
            Slot::Loaded { object: HeapObject { identity_hash, body }, persisted: None },
        );
        id
    }

    /// Whether the object is in memory.
    pub fn is_loaded(&self, id: InstanceId) -> bool {
        matches!(self.slots.get(&id), Some(Slot::Loaded { .. }))
    }

    /// Number of objects in memory.
    pub fn loaded_count(&self) -> usize {
        self.slots.values().filter(|slot| matches!(slot, Slot::Loaded { .. })).count()
    }

    /// Reads a stub's record, billing the read. Loading happens at most once per object.
    pub fn ensure_loaded<S: WorldState>(
        &mut self,
        id: InstanceId,
        overlay: &mut StorageOverlay<S>,
        ledger: &mut EnergyLedger,
    ) -> Result<(), PersistenceError> {
        match self.slots.get(&id) {
            Some(Slot::Loaded { .. }) => return Ok(()),
            Some(Slot::Stub) => {}
            None => return Err(StreamCorruption::MissingRecord { id }.into()),
        }
        let bytes = overlay.storage(self.address, &instance_key(id))?;
        ledger.charge(EnergyCharge::StorageRead { bytes: bytes.len() as u64 })?;
        if bytes.is_empty() {
            return Err(StreamCorruption::MissingRecord { id }.into());
        }
        let object = HeapObject::decode(&bytes, &self.registry, SplitBoundary::Registered)?;
        for reference in object.references() {
            self.slots.entry(reference).or_insert(Slot::Stub);
        }
        trace!(target: "avm::persistence", %id, len = bytes.len(), "Loaded instance");
        self.slots.insert(id, Slot::Loaded { object, persisted: Some(bytes) });
        Ok(())
    }

    /// A loaded object.
    pub fn object(&self, id: InstanceId) -> Option<&HeapObject> {
        match self.slots.get(&id) {
            Some(Slot::Loaded { object, .. }) => Some(object),
            _ => None,
        }
    }

    /// A loaded object, mutably.
    pub fn object_mut(&mut self, id: InstanceId) -> Option<&mut HeapObject> {
        match self.slots.get_mut(&id) {
            Some(Slot::Loaded { object, .. }) => Some(object),
            _ => None,
        }
    }

    /// Loads and returns an object.
    pub fn load<S: WorldState>(
        &mut self,
        id: InstanceId,
        overlay: &mut StorageOverlay<S>,
        ledger: &mut EnergyLedger,
    ) -> Result<&mut HeapObject, PersistenceError> {
        self.ensure_loaded(id, overlay, ledger)?;
        self.object_mut(id).ok_or_else(|| StreamCorruption::MissingRecord { id }.into())
    }

    /// Finds every object reachable from the statics, loading stubs on the way.
    ///
    /// The walk is breadth-first over ids with an id-keyed visited set, so shared and cyclic
    /// structures are visited once.
    pub fn reachable<S: WorldState>(
        &mut self,
        overlay: &mut StorageOverlay<S>,
        ledger: &mut EnergyLedger,
    ) -> Result<BTreeSet<InstanceId>, PersistenceError> {
        let mut visited = BTreeSet::new();
        let mut worklist: VecDeque<InstanceId> = self.root.references().collect();
        while let Some(id) = worklist.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let object = self.load(id, overlay, ledger)?;
            worklist.extend(object.references().into_iter().filter(|r| !visited.contains(r)));
        }
        Ok(visited)
    }

    /// Persists the reachable graph and reclaims what fell out of it.
    ///
    /// Every reachable object is encoded; new records are billed as write-new, changed records
    /// as write-update, unchanged records cost nothing. Previously persisted instances that are
    /// no longer reachable are tombstoned and credited once each. The root record is written
    /// only if it changed.
    pub fn commit<S: WorldState>(
        &mut self,
        overlay: &mut StorageOverlay<S>,
        ledger: &mut EnergyLedger,
    ) -> Result<CommitReport, PersistenceError> {
        let reachable = self.reachable(overlay, ledger)?;
        let mut report = CommitReport { reachable: reachable.len(), ..Default::default() };

        for &id in &reachable {
            let Some(Slot::Loaded { object, persisted }) = self.slots.get_mut(&id) else {
                return Err(StreamCorruption::MissingRecord { id }.into());
            };
            let bytes = Bytes::from(object.encode(&self.registry, SplitBoundary::Registered)?);
            let len = bytes.len() as u64;
            match persisted {
                None => {
                    ledger.charge(EnergyCharge::WriteNew { bytes: len })?;
                    report.written_new += 1;
                }
                Some(previous) if *previous != bytes => {
                    ledger.charge(EnergyCharge::WriteUpdate { bytes: len })?;
                    report.written_updated += 1;
                }
                Some(_) => continue,
            }
            overlay.put_storage(self.address, instance_key(id), bytes.clone());
            *persisted = Some(bytes);
        }

        let unreachable: Vec<InstanceId> =
            self.root.live.iter().copied().filter(|id| !reachable.contains(id)).collect();
        for &id in &unreachable {
            overlay.put_storage(self.address, instance_key(id), Bytes::new());
            self.slots.remove(&id);
        }
        if !unreachable.is_empty() {
            ledger.charge(EnergyCharge::Reclaim { instances: unreachable.len() as u64 })?;
            report.reclaimed = unreachable.len();
        }
        // Objects allocated during the activation that never became reachable are dropped.
        self.slots.retain(|id, _| reachable.contains(id));
        self.root.live = reachable;

        let root = Bytes::from(self.root.encode(&self.registry));
        if self.persisted_root.as_ref() != Some(&root) {
            let len = root.len() as u64;
            let charge = match self.persisted_root {
                None => EnergyCharge::WriteNew { bytes: len },
                Some(_) => EnergyCharge::WriteUpdate { bytes: len },
            };
            ledger.charge(charge)?;
            overlay.put_storage(self.address, root_key(), root.clone());
            self.persisted_root = Some(root);
            report.root_written = true;
        }

        debug!(
            target: "avm::persistence",
            address = %self.address,
            reachable = report.reachable,
            written_new = report.written_new,
            written_updated = report.written_updated,
            reclaimed = report.reclaimed,
            root_written = report.root_written,
            "Committed heap"
        );
        Ok(report)
    }

    /// The root record bytes as last read or written.
    pub fn root_state(&self) -> Bytes {
        self.persisted_root.clone().unwrap_or_default()
    }

    /// Tombstones the root record and every persisted instance. Nothing is committed after
    /// this.
    pub fn destroy<S: WorldState>(&mut self, overlay: &mut StorageOverlay<S>) {
        for &id in &self.root.live {
            overlay.put_storage(self.address, instance_key(id), Bytes::new());
        }
        overlay.put_storage(self.address, root_key(), Bytes::new());
        self.slots.clear();
        self.root.live.clear();
        self.persisted_root = None;
        self.destroyed = true;
        debug!(target: "avm::persistence", address = %self.address, "Destroyed heap");
    }
}
