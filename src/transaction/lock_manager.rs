// Per-site lock manager: read/write locks with reader-sharing and
// sole-reader promotion.

use std::collections::{BTreeSet, HashMap};

use crate::common::{TransactionId, VariableId};
use crate::transaction::types::LockMode;

/// Arbitrates access to a single site's variables. Pure bookkeeping: every
/// call is synchronous and immediate — this engine has no concurrent
/// callers, so there is nothing here to block on, only a boolean
/// granted/denied result.
#[derive(Debug, Default)]
pub struct LockManager {
    table: HashMap<VariableId, (BTreeSet<TransactionId>, LockMode)>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to grant `mode` on `variable` to `txid`. Returns whether
    /// the lock was granted.
    pub fn try_lock(&mut self, variable: VariableId, txid: TransactionId, mode: LockMode) -> bool {
        let entry = self
            .table
            .entry(variable)
            .or_insert_with(|| (BTreeSet::new(), LockMode::Read));

        if entry.0.is_empty() {
            entry.0.insert(txid);
            entry.1 = mode;
            return true;
        }

        if entry.0.contains(&txid) {
            return match mode {
                LockMode::Write => {
                    if entry.0.len() == 1 {
                        entry.1 = LockMode::Write;
                        true
                    } else {
                        // A second reader present blocks promotion even if
                        // it joined after the promoting transaction.
                        false
                    }
                }
                LockMode::Read => true,
            };
        }

        match (entry.1, mode) {
            (LockMode::Read, LockMode::Read) => {
                entry.0.insert(txid);
                true
            }
            _ => false,
        }
    }

    /// Current holders and mode for `variable`, or `None` if unlocked.
    pub fn get_locks(&self, variable: VariableId) -> Option<(&BTreeSet<TransactionId>, LockMode)> {
        self.table.get(&variable).map(|(holders, mode)| (holders, *mode))
    }

    /// Releases `txid`'s hold on `variable`.
    ///
    /// # Panics
    ///
    /// Panics if `variable` is not held by `txid` — unlocking a lock you
    /// don't hold is a programmer error.
    pub fn unlock(&mut self, variable: VariableId, txid: TransactionId) {
        let entry = self
            .table
            .get_mut(&variable)
            .unwrap_or_else(|| panic!("variable x{} is not locked at all", variable));

        if !entry.0.remove(&txid) {
            panic!("variable x{} is not locked by T{}", variable, txid);
        }
        if entry.0.is_empty() {
            entry.1 = LockMode::Read;
        }
    }

    /// Releases every lock `txid` holds across all variables at this site.
    pub fn unlock_all(&mut self, txid: TransactionId) {
        for (holders, _) in self.table.values_mut() {
            holders.remove(&txid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claimant_wins_the_lock() {
        let mut lm = LockManager::new();
        assert!(lm.try_lock(1, 10, LockMode::Write));
        assert!(!lm.try_lock(1, 20, LockMode::Read));
    }

    #[test]
    fn readers_can_share() {
        let mut lm = LockManager::new();
        assert!(lm.try_lock(1, 10, LockMode::Read));
        assert!(lm.try_lock(1, 20, LockMode::Read));
        let (holders, mode) = lm.get_locks(1).unwrap();
        assert_eq!(holders.len(), 2);
        assert!(matches!(mode, LockMode::Read));
    }

    #[test]
    fn sole_reader_can_promote_to_writer() {
        let mut lm = LockManager::new();
        assert!(lm.try_lock(1, 10, LockMode::Read));
        assert!(lm.try_lock(1, 10, LockMode::Write));
    }

    #[test]
    fn shared_readers_block_promotion() {
        let mut lm = LockManager::new();
        assert!(lm.try_lock(1, 10, LockMode::Read));
        assert!(lm.try_lock(1, 20, LockMode::Read));
        assert!(!lm.try_lock(1, 10, LockMode::Write));
    }

    #[test]
    fn unlock_clears_empty_entries() {
        let mut lm = LockManager::new();
        lm.try_lock(1, 10, LockMode::Write);
        lm.unlock(1, 10);
        assert!(lm.try_lock(1, 20, LockMode::Read));
    }

    #[test]
    #[should_panic(expected = "not locked by")]
    fn unlock_not_held_panics() {
        let mut lm = LockManager::new();
        lm.try_lock(1, 10, LockMode::Read);
        lm.unlock(1, 20);
    }

    #[test]
    fn unlock_all_releases_every_variable() {
        let mut lm = LockManager::new();
        lm.try_lock(1, 10, LockMode::Write);
        lm.try_lock(2, 10, LockMode::Read);
        lm.unlock_all(10);
        assert!(lm.try_lock(1, 30, LockMode::Write));
        assert!(lm.try_lock(2, 30, LockMode::Write));
    }
}
