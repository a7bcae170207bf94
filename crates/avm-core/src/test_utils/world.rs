use core::convert::Infallible;
use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes};
use delegate::delegate;

use crate::storage::WorldState;

/// An in-memory world state for tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryWorldState {
    code: BTreeMap<Address, Bytes>,
    storage: BTreeMap<(Address, Bytes), Bytes>,
}

impl MemoryWorldState {
    /// Sets the code of an account.
    pub fn set_code(&mut self, address: Address, code: Bytes) {
        if code.is_empty() {
            self.code.remove(&address);
        } else {
            self.code.insert(address, code);
        }
    }

    /// Sets the code of an account.
    pub fn account_code(mut self, address: Address, code: Bytes) -> Self {
        self.set_code(address, code);
        self
    }

    /// The code of an account, empty if none.
    pub fn code_of(&self, address: Address) -> Bytes {
        self.code.get(&address).cloned().unwrap_or_default()
    }

    /// Sets a storage value; an empty value removes the entry.
    pub fn set_storage(&mut self, address: Address, key: Bytes, value: Bytes) {
        if value.is_empty() {
            self.storage.remove(&(address, key));
        } else {
            self.storage.insert((address, key), value);
        }
    }

    /// A storage value, empty if none.
    pub fn storage_value(&self, address: Address, key: &[u8]) -> Bytes {
        self.storage
            .get(&(address, Bytes::copy_from_slice(key)))
            .cloned()
            .unwrap_or_default()
    }

    /// Every storage entry of an account, ordered by key.
    pub fn storage_of(&self, address: Address) -> Vec<(Bytes, Bytes)> {
        self.storage
            .iter()
            .filter(|((owner, _), _)| *owner == address)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }

    delegate! {
        to self.storage {
            /// Number of storage entries across all accounts.
            #[call(len)]
            pub fn storage_len(&self) -> usize;
        }
    }
}

impl WorldState for MemoryWorldState {
    type Error = Infallible;

    fn code(&mut self, address: Address) -> Result<Bytes, Self::Error> {
        Ok(self.code_of(address))
    }

    fn put_code(&mut self, address: Address, code: Bytes) -> Result<(), Self::Error> {
        self.set_code(address, code);
        Ok(())
    }

    fn storage(&mut self, address: Address, key: &[u8]) -> Result<Bytes, Self::Error> {
        Ok(self.storage_value(address, key))
    }

    fn put_storage(
        &mut self,
        address: Address,
        key: Bytes,
        value: Bytes,
    ) -> Result<(), Self::Error> {
        self.set_storage(address, key, value);
        Ok(())
    }
}
