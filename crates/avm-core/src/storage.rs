//! The world-state boundary and the write overlay of an invocation.
//!
//! The sandbox never writes through to the world state while code runs. Every write lands in a
//! [`StorageOverlay`] that journals the previous value, so a failed nested call can be rolled
//! back to a checkpoint and a failed invocation can be dropped wholesale. Only a successful
//! invocation [`flush`](StorageOverlay::flush)es.

use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes};
use auto_impl::auto_impl;
use tracing::trace;

use crate::{constants::storage as keys, InstanceId, StorageError};

/// Account code and storage as seen by the sandbox.
///
/// Values are opaque byte strings; an empty value stands for an absent entry.
#[auto_impl(&mut, Box)]
pub trait WorldState {
    /// The backend's error type.
    type Error: core::fmt::Display + core::fmt::Debug;

    /// The code stored at `address`, empty if none.
    fn code(&mut self, address: Address) -> Result<Bytes, Self::Error>;

    /// Replaces the code stored at `address`; empty code removes it.
    fn put_code(&mut self, address: Address, code: Bytes) -> Result<(), Self::Error>;

    /// The storage value of `address` under `key`, empty if none.
    fn storage(&mut self, address: Address, key: &[u8]) -> Result<Bytes, Self::Error>;

    /// Replaces the storage value of `address` under `key`; an empty value removes it.
    fn put_storage(&mut self, address: Address, key: Bytes, value: Bytes)
        -> Result<(), Self::Error>;
}

/// The storage key of an instance record.
pub fn instance_key(id: InstanceId) -> Bytes {
    let mut key = Vec::with_capacity(9);
    key.push(keys::INSTANCE_KEY_PREFIX);
    key.extend_from_slice(&id.0.to_be_bytes());
    key.into()
}

/// The storage key of the root record.
pub fn root_key() -> Bytes {
    Bytes::from_static(keys::ROOT_RECORD_KEY)
}

#[derive(Debug, Clone)]
enum JournalEntry {
    Storage { address: Address, key: Bytes, previous: Option<Bytes> },
    Code { address: Address, previous: Option<Bytes> },
}

/// A journaled write buffer over a [`WorldState`].
#[derive(Debug)]
pub struct StorageOverlay<S> {
    state: S,
    storage: BTreeMap<(Address, Bytes), Bytes>,
    code: BTreeMap<Address, Bytes>,
    journal: Vec<JournalEntry>,
}

/// A position in the overlay's journal to roll back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

impl<S: WorldState> StorageOverlay<S> {
    /// Wraps a world state with an empty overlay.
    pub const fn new(state: S) -> Self {
        Self { state, storage: BTreeMap::new(), code: BTreeMap::new(), journal: Vec::new() }
    }

    /// The storage value of `address` under `key`, pending writes first.
    pub fn storage(&mut self, address: Address, key: &[u8]) -> Result<Bytes, StorageError> {
        if let Some(value) = self.storage.get(&(address, Bytes::copy_from_slice(key))) {
            return Ok(value.clone());
        }
        self.state.storage(address, key).map_err(|e| StorageError(e.to_string()))
    }

    /// Buffers a storage write.
    pub fn put_storage(&mut self, address: Address, key: Bytes, value: Bytes) {
        trace!(target: "avm::storage", %address, key = %key, len = value.len(), "Buffered write");
        let previous = self.storage.insert((address, key.clone()), value);
        self.journal.push(JournalEntry::Storage { address, key, previous });
    }

    /// The code stored at `address`, pending writes first.
    pub fn code(&mut self, address: Address) -> Result<Bytes, StorageError> {
        if let Some(code) = self.code.get(&address) {
            return Ok(code.clone());
        }
        self.state.code(address).map_err(|e| StorageError(e.to_string()))
    }

    /// Buffers a code write.
    pub fn put_code(&mut self, address: Address, code: Bytes) {
        let previous = self.code.insert(address, code);
        self.journal.push(JournalEntry::Code { address, previous });
    }

    /// Marks the current journal position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.journal.len())
    }

    /// Undoes every write buffered since `checkpoint`.
    pub fn revert_to(&mut self, checkpoint: Checkpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(entry) = self.journal.pop() else { break };
            match entry {
                JournalEntry::Storage { address, key, previous } => match previous {
                    Some(value) => {
                        self.storage.insert((address, key), value);
                    }
                    None => {
                        self.storage.remove(&(address, key));
                    }
                },
                JournalEntry::Code { address, previous } => match previous {
                    Some(code) => {
                        self.code.insert(address, code);
                    }
                    None => {
                        self.code.remove(&address);
                    }
                },
            }
        }
    }

    /// Number of buffered storage entries.
    pub fn pending_writes(&self) -> usize {
        self.storage.len()
    }

    /// Writes every buffered entry through to the world state, returning it.
    pub fn flush(mut self) -> Result<S, StorageError> {
        for (address, code) in core::mem::take(&mut self.code) {
            self.state.put_code(address, code).map_err(|e| StorageError(e.to_string()))?;
        }
        for ((address, key), value) in core::mem::take(&mut self.storage) {
            self.state.put_storage(address, key, value).map_err(|e| StorageError(e.to_string()))?;
        }
        Ok(self.state)
    }

    /// Drops every buffered write, returning the untouched world state.
    pub fn discard(self) -> S {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryWorldState;
    use alloy_primitives::address;

    const CONTRACT: Address = address!("0x1000000000000000000000000000000000000001");

    #[test]
    fn test_instance_keys_are_prefixed_big_endian() {
        assert_eq!(instance_key(InstanceId(0x0102)).as_ref(), &[1, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(root_key().as_ref(), &[0]);
    }

    #[test]
    fn test_checkpoint_restores_previous_values() {
        let mut world = MemoryWorldState::default();
        world.set_storage(CONTRACT, root_key(), Bytes::from_static(b"old"));

        let mut overlay = StorageOverlay::new(&mut world);
        overlay.put_storage(CONTRACT, root_key(), Bytes::from_static(b"a"));
        let checkpoint = overlay.checkpoint();
        overlay.put_storage(CONTRACT, root_key(), Bytes::from_static(b"b"));
        overlay.put_storage(CONTRACT, instance_key(InstanceId(1)), Bytes::from_static(b"c"));
        overlay.put_code(CONTRACT, Bytes::from_static(b"code"));
        assert_eq!(overlay.storage(CONTRACT, &root_key()).unwrap().as_ref(), b"b");

        overlay.revert_to(checkpoint);
        assert_eq!(overlay.storage(CONTRACT, &root_key()).unwrap().as_ref(), b"a");
        assert!(overlay.storage(CONTRACT, &instance_key(InstanceId(1))).unwrap().is_empty());
        assert!(overlay.code(CONTRACT).unwrap().is_empty());

        overlay.flush().unwrap();
        assert_eq!(world.storage_value(CONTRACT, &root_key()).as_ref(), b"a");
    }

    #[test]
    fn test_discard_leaves_state_untouched() {
        let mut world = MemoryWorldState::default();
        let mut overlay = StorageOverlay::new(&mut world);
        overlay.put_storage(CONTRACT, root_key(), Bytes::from_static(b"x"));
        overlay.discard();
        assert!(world.storage_value(CONTRACT, &root_key()).is_empty());
    }
}
