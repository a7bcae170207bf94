//! # Energy metering
//!
//! Every unit of work an invocation performs is paid for through a single
//! [`EnergyLedger::charge`] call: executed instructions, container calls, allocations, record
//! reads and writes, and reclamation credits. The ledger holds a fixed budget and refuses any
//! charge that would exceed it.
//!
//! ## Exhaustion
//!
//! Exhaustion is sticky: once a charge has been refused, every later charge is refused too and
//! [`EnergyLedger::energy_used`] reports the whole budget. The invocation is expected to unwind
//! and discard its writes.
//!
//! ## Credits
//!
//! Reclamation credits lower the reported consumption but never raise the budget: the limit is
//! checked against gross debits only, so a credit earned at commit cannot pay for work done
//! earlier in the same invocation.
//!
//! ## Nesting
//!
//! A cross-contract call runs against a [`child`](EnergyLedger::child) ledger whose limit is the
//! caller's remaining energy. When the callee returns, its usage is
//! [`fold`](EnergyLedger::fold)ed back into the caller. A callee that is rolled back keeps its
//! debits but loses its credits through [`fold_debits`](EnergyLedger::fold_debits), since the
//! reclamations they paid for were discarded with its writes. For the same reason a failed
//! invocation [`forfeit_credits`](EnergyLedger::forfeit_credits) before it is reported.

mod schedule;
pub use schedule::*;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ResourceExhaustion;

/// Energy consumed so far, by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyUsage {
    /// Execution and allocation.
    pub compute: u64,
    /// Record reads.
    pub storage_read: u64,
    /// Record and code writes.
    pub storage_write: u64,
    /// Reclamation credits earned.
    pub reclaim_credit: u64,
}

impl EnergyUsage {
    /// Total debits, ignoring credits.
    pub const fn gross(&self) -> u64 {
        self.compute.saturating_add(self.storage_read).saturating_add(self.storage_write)
    }

    /// Debits minus credits. Negative when an invocation reclaimed more than it spent.
    pub fn total(&self) -> i64 {
        self.gross() as i64 - self.reclaim_credit as i64
    }

    fn add(&mut self, category: EnergyCategory, amount: u64) {
        let bucket = match category {
            EnergyCategory::Compute => &mut self.compute,
            EnergyCategory::StorageRead => &mut self.storage_read,
            EnergyCategory::StorageWrite => &mut self.storage_write,
            EnergyCategory::Reclaim => &mut self.reclaim_credit,
        };
        *bucket = bucket.saturating_add(amount);
    }

    fn merge(&mut self, other: &Self) {
        self.compute = self.compute.saturating_add(other.compute);
        self.storage_read = self.storage_read.saturating_add(other.storage_read);
        self.storage_write = self.storage_write.saturating_add(other.storage_write);
        self.reclaim_credit = self.reclaim_credit.saturating_add(other.reclaim_credit);
    }
}

/// The metering ledger of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyLedger {
    limit: u64,
    schedule: EnergySchedule,
    usage: EnergyUsage,
    exhausted: bool,
}

impl EnergyLedger {
    /// Creates a ledger with the given budget and price list.
    pub fn new(limit: u64, schedule: EnergySchedule) -> Self {
        Self { limit, schedule, usage: EnergyUsage::default(), exhausted: false }
    }

    /// The budget.
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// The price list.
    pub const fn schedule(&self) -> &EnergySchedule {
        &self.schedule
    }

    /// Usage so far, by category.
    pub const fn usage(&self) -> &EnergyUsage {
        &self.usage
    }

    /// Whether a charge has been refused.
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Budget left for debits.
    pub const fn remaining(&self) -> u64 {
        if self.exhausted {
            return 0;
        }
        self.limit.saturating_sub(self.usage.gross())
    }

    /// The consumption reported for the invocation: the whole budget once exhausted, otherwise
    /// debits minus credits.
    pub fn energy_used(&self) -> i64 {
        if self.exhausted {
            return self.limit as i64;
        }
        self.usage.total()
    }

    /// Applies one charge.
    ///
    /// Credits always succeed. A debit that would bring gross consumption past the limit is not
    /// applied and marks the ledger exhausted.
    pub fn charge(&mut self, charge: EnergyCharge) -> Result<(), ResourceExhaustion> {
        let amount = self.schedule.cost(charge);
        let category = charge.category();
        if category == EnergyCategory::Reclaim {
            self.usage.add(category, amount);
            trace!(target: "avm::ledger", ?charge, amount, "Energy credited");
            return Ok(());
        }
        if self.exhausted {
            return Err(self.exhaustion(self.limit.saturating_add(amount)));
        }
        let required = self.usage.gross().saturating_add(amount);
        if required > self.limit {
            self.exhausted = true;
            debug!(
                target: "avm::ledger",
                ?charge,
                required,
                limit = self.limit,
                "Energy limit exceeded"
            );
            return Err(self.exhaustion(required));
        }
        self.usage.add(category, amount);
        Ok(())
    }

    /// Marks the ledger exhausted without a charge, e.g. when a nested call ran out.
    pub fn exhaust(&mut self) -> ResourceExhaustion {
        self.exhausted = true;
        self.exhaustion(self.limit.saturating_add(1))
    }

    const fn exhaustion(&self, required: u64) -> ResourceExhaustion {
        ResourceExhaustion { limit: self.limit, required }
    }

    /// A ledger for a nested call, limited to this ledger's remaining budget.
    pub fn child(&self) -> Self {
        Self::new(self.remaining(), self.schedule)
    }

    /// Folds a nested call's usage back into this ledger.
    pub fn fold(&mut self, child: &Self) {
        self.usage.merge(&child.usage);
        if child.exhausted {
            self.exhausted = true;
        }
    }

    /// Folds a rolled-back nested call into this ledger, dropping its reclamation credits.
    pub fn fold_debits(&mut self, child: &Self) {
        self.usage.merge(&EnergyUsage { reclaim_credit: 0, ..child.usage });
        if child.exhausted {
            self.exhausted = true;
        }
    }

    /// Drops every credit earned so far. The reclaimed records were never tombstoned.
    pub fn forfeit_credits(&mut self) {
        if self.usage.reclaim_credit > 0 {
            trace!(target: "avm::ledger", credit = self.usage.reclaim_credit, "Credits forfeited");
        }
        self.usage.reclaim_credit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(limit: u64) -> EnergyLedger {
        EnergyLedger::new(limit, EnergySchedule::default())
    }

    #[test]
    fn test_charges_accumulate_by_category() {
        let mut ledger = ledger(100_000);
        ledger.charge(EnergyCharge::Instruction).unwrap();
        ledger.charge(EnergyCharge::StorageRead { bytes: 10 }).unwrap();
        ledger.charge(EnergyCharge::WriteUpdate { bytes: 4 }).unwrap();
        assert_eq!(
            *ledger.usage(),
            EnergyUsage { compute: 1, storage_read: 5_010, storage_write: 5_004, reclaim_credit: 0 }
        );
        assert_eq!(ledger.energy_used(), 10_015);
    }

    #[test]
    fn test_limit_is_never_exceeded() {
        let mut ledger = ledger(3);
        for _ in 0..3 {
            ledger.charge(EnergyCharge::Instruction).unwrap();
        }
        assert_eq!(ledger.remaining(), 0);
        assert_eq!(
            ledger.charge(EnergyCharge::Instruction),
            Err(ResourceExhaustion { limit: 3, required: 4 })
        );
        assert!(ledger.is_exhausted());
        assert_eq!(ledger.usage().compute, 3);
        assert_eq!(ledger.energy_used(), 3);
        // Sticky, even for a charge that would fit a fresh ledger.
        assert!(ledger.charge(EnergyCharge::Instruction).is_err());
    }

    #[test]
    fn test_credits_do_not_extend_the_budget() {
        let mut ledger = ledger(25_000);
        ledger.charge(EnergyCharge::WriteNew { bytes: 0 }).unwrap();
        ledger.charge(EnergyCharge::Reclaim { instances: 1 }).unwrap();
        assert_eq!(ledger.energy_used(), 0);
        assert_eq!(ledger.remaining(), 5_000);
        assert!(ledger.charge(EnergyCharge::WriteUpdate { bytes: 1 }).is_err());
    }

    #[test]
    fn test_child_usage_folds_into_parent() {
        let mut parent = ledger(100);
        parent.charge(EnergyCharge::Native).unwrap();
        let mut child = parent.child();
        assert_eq!(child.limit(), 80);
        child.charge(EnergyCharge::Invoke).unwrap();
        parent.fold(&child);
        assert_eq!(parent.usage().compute, 25);

        let mut child = parent.child();
        child.charge(EnergyCharge::Reclaim { instances: 1 }).unwrap();
        parent.fold(&child);
        assert_eq!(parent.usage().reclaim_credit, 20_000);
        assert_eq!(parent.energy_used(), 25 - 20_000);

        let mut child = parent.child();
        assert!(child.charge(EnergyCharge::StorageRead { bytes: 0 }).is_err());
        parent.fold(&child);
        assert!(parent.is_exhausted());
        assert_eq!(parent.energy_used(), 100);
    }

    #[test]
    fn test_rolled_back_child_keeps_only_debits() {
        let mut parent = ledger(100_000);
        let mut child = parent.child();
        child.charge(EnergyCharge::Invoke).unwrap();
        child.charge(EnergyCharge::Reclaim { instances: 3 }).unwrap();
        parent.fold_debits(&child);
        assert_eq!(
            *parent.usage(),
            EnergyUsage { compute: 5, storage_read: 0, storage_write: 0, reclaim_credit: 0 }
        );
        assert_eq!(parent.energy_used(), 5);
    }

    #[test]
    fn test_forfeited_credits() {
        let mut ledger = ledger(100_000);
        ledger.charge(EnergyCharge::WriteUpdate { bytes: 0 }).unwrap();
        ledger.charge(EnergyCharge::Reclaim { instances: 2 }).unwrap();
        assert_eq!(ledger.energy_used(), 5_000 - 40_000);
        ledger.forfeit_credits();
        assert_eq!(ledger.usage().reclaim_credit, 0);
        assert_eq!(ledger.energy_used(), 5_000);
    }
}
