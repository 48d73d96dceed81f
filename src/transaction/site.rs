// A single database site: a `DatabaseStore` bound to a `LockManager` with
// replication-level state layered on top — availability tracking, pending
// writes, up/down lifecycle, and refcounted multiversion snapshots.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::common::{SiteId, Tick, TransactionId, VariableId};
use crate::error::{DbError, Result};
use crate::store::DatabaseStore;
use crate::transaction::types::{LockMode, OperationStatus};
use crate::transaction::lock_manager::LockManager;

/// Raised when an operation would require an up site but the site is down.
/// Not fatal — the transaction manager catches this to drive the
/// available-copies algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteDown;

struct Snapshot {
    refcount: u32,
    values: HashMap<VariableId, i64>,
}

/// One of the ten replicas.
pub struct Site {
    index: SiteId,
    variables: BTreeSet<VariableId>,
    owned_variables: BTreeSet<VariableId>,
    up_since: Option<Tick>,
    available_for_read: HashSet<VariableId>,
    store: DatabaseStore,
    locks: LockManager,
    pending_writes: HashMap<TransactionId, Vec<(VariableId, i64)>>,
    snapshots: HashMap<Tick, Snapshot>,
}

impl Site {
    /// Opens (and recovers) `index`'s store under `data_dir`, up as of
    /// `tick`. All hosted variables are available for read immediately —
    /// there has been no failure yet to gate them.
    pub fn open(
        index: SiteId,
        hosted_variables: &[VariableId],
        owned_variables: &[VariableId],
        tick: Tick,
        data_dir: &Path,
    ) -> Result<Self> {
        let store = DatabaseStore::open(index, hosted_variables, data_dir)?;
        Ok(Self {
            index,
            variables: hosted_variables.iter().copied().collect(),
            owned_variables: owned_variables.iter().copied().collect(),
            up_since: Some(tick),
            available_for_read: hosted_variables.iter().copied().collect(),
            store,
            locks: LockManager::new(),
            pending_writes: HashMap::new(),
            snapshots: HashMap::new(),
        })
    }

    pub fn index(&self) -> SiteId {
        self.index
    }

    pub fn is_up(&self) -> bool {
        self.up_since.is_some()
    }

    pub fn up_since(&self) -> Option<Tick> {
        self.up_since
    }

    pub fn hosts(&self, variable: VariableId) -> bool {
        self.variables.contains(&variable)
    }

    fn readable_without_lock(&self, variable: VariableId) -> bool {
        self.owned_variables.contains(&variable) || self.available_for_read.contains(&variable)
    }

    /// Attempts a read for `txid`. `None` means this site does not host
    /// `variable` at all. `ro_tick`, when given, reads from that snapshot
    /// and ignores the site's up/down state entirely (a multiversion clone
    /// is always local to the caller that took it).
    ///
    /// # Panics
    ///
    /// Panics if `ro_tick` names a snapshot this site never took — a
    /// caller bookkeeping bug.
    pub fn try_read(
        &mut self,
        txid: TransactionId,
        variable: VariableId,
        ro_tick: Option<Tick>,
    ) -> std::result::Result<Option<OperationStatus>, SiteDown> {
        if let Some(tick) = ro_tick {
            if !self.variables.contains(&variable) {
                return Ok(None);
            }
            let snapshot = self
                .snapshots
                .get(&tick)
                .unwrap_or_else(|| panic!("snapshot at t{} does not exist on site {}", tick, self.index));
            let value = *snapshot
                .values
                .get(&variable)
                .unwrap_or_else(|| panic!("snapshot at t{} has no value for x{}", tick, variable));
            return Ok(Some(OperationStatus::Success { variable, value }));
        }

        if !self.is_up() {
            return Err(SiteDown);
        }
        if !self.variables.contains(&variable) {
            return Ok(None);
        }
        if !self.readable_without_lock(variable) {
            return Ok(None);
        }

        if self.locks.try_lock(variable, txid, LockMode::Read) {
            let value = self
                .pending_writes
                .get(&txid)
                .and_then(|writes| writes.iter().find(|(v, _)| *v == variable).map(|(_, v)| *v))
                .unwrap_or_else(|| self.store.read(variable).expect("hosted variable must have a value"));
            Ok(Some(OperationStatus::Success { variable, value }))
        } else {
            let (holders, _) = self.locks.get_locks(variable).expect("conflict implies an entry");
            Ok(Some(OperationStatus::Blocked {
                variable,
                waits_for: holders.clone(),
            }))
        }
    }

    /// Attempts a write for `txid`. Writes are buffered in
    /// `pending_writes` and only flushed to the store on `commit`.
    pub fn try_write(
        &mut self,
        txid: TransactionId,
        variable: VariableId,
        value: i64,
    ) -> std::result::Result<Option<OperationStatus>, SiteDown> {
        if !self.is_up() {
            return Err(SiteDown);
        }
        if !self.variables.contains(&variable) {
            return Ok(None);
        }

        if self.locks.try_lock(variable, txid, LockMode::Write) {
            self.pending_writes.entry(txid).or_default().push((variable, value));
            Ok(Some(OperationStatus::Success { variable, value }))
        } else {
            let (holders, _) = self.locks.get_locks(variable).expect("conflict implies an entry");
            Ok(Some(OperationStatus::Blocked {
                variable,
                waits_for: holders.clone(),
            }))
        }
    }

    /// Flushes `txid`'s pending writes (if any) to the store, marks their
    /// variables available for read, and releases all of `txid`'s locks.
    ///
    /// `ro_tick` is `None` for an RW transaction (down sites are rejected)
    /// and `Some(begin_tick)` for a read-only transaction releasing its
    /// snapshot (down state is irrelevant — read-only transactions only
    /// ever touched a snapshot, never the live site).
    pub fn commit(&mut self, txid: TransactionId, ro_tick: Option<Tick>) -> Result<()> {
        if ro_tick.is_none() && !self.is_up() {
            return Err(DbError::Storage(format!(
                "cannot commit T{} on down site {}",
                txid, self.index
            )));
        }

        if let Some(writes) = self.pending_writes.remove(&txid) {
            self.store.batch_write(&writes)?;
            for (variable, _) in &writes {
                self.available_for_read.insert(*variable);
            }
        }
        self.locks.unlock_all(txid);

        if let Some(tick) = ro_tick {
            self.release_snapshot(txid, tick);
        }
        Ok(())
    }

    /// Like `commit`, but discards pending writes instead of flushing them.
    pub fn abort(&mut self, txid: TransactionId, ro_tick: Option<Tick>) -> Result<()> {
        if ro_tick.is_none() && !self.is_up() {
            return Err(DbError::Storage(format!(
                "cannot abort T{} on down site {}",
                txid, self.index
            )));
        }

        self.pending_writes.remove(&txid);
        self.locks.unlock_all(txid);

        if let Some(tick) = ro_tick {
            self.release_snapshot(txid, tick);
        }
        Ok(())
    }

    fn release_snapshot(&mut self, txid: TransactionId, tick: Tick) {
        let refcount = {
            let snapshot = self
                .snapshots
                .get_mut(&tick)
                .unwrap_or_else(|| panic!("T{} released unknown snapshot at t{}", txid, tick));
            snapshot.refcount -= 1;
            snapshot.refcount
        };
        if refcount == 0 {
            self.snapshots.remove(&tick);
        }
    }

    /// Fails the site: clears availability, locks, and pending writes.
    /// Snapshots survive — read-only transactions must still see their
    /// tick's values after this site goes down.
    pub fn fail(&mut self) {
        debug!(site = self.index, "failing");
        self.up_since = None;
        self.available_for_read.clear();
        self.locks = LockManager::new();
        self.pending_writes.clear();
    }

    /// Recovers a down site at `tick`. Availability stays empty: even
    /// variables need a fresh commit before non-owner reads may return
    /// them again.
    ///
    /// # Panics
    ///
    /// Panics if the site was not actually down: recovery only makes sense
    /// as a `DOWN -> UP` transition.
    pub fn recover(&mut self, tick: Tick) {
        assert!(!self.is_up(), "site {} is not down; cannot recover()", self.index);
        self.up_since = Some(tick);
    }

    /// Creates (or bumps the refcount of) an immutable snapshot of this
    /// site's committed values at `tick`, shared by every RO transaction
    /// that begins at the same tick.
    ///
    /// # Panics
    ///
    /// Panics if the site is down — a read-only transaction may only clone
    /// a site that is up at the moment it begins.
    pub fn multiversion_clone(&mut self, tick: Tick) {
        assert!(self.is_up(), "site {} is down; cannot clone", self.index);
        self.snapshots
            .entry(tick)
            .and_modify(|s| s.refcount += 1)
            .or_insert_with(|| Snapshot {
                refcount: 1,
                values: self.store.snapshot(),
            });
    }

    /// Debug dump: committed values and per-variable read availability.
    pub fn dump(&self) -> (HashMap<VariableId, i64>, HashMap<VariableId, bool>) {
        let values: HashMap<VariableId, i64> = self
            .variables
            .iter()
            .filter_map(|&v| self.store.read(v).map(|value| (v, value)))
            .collect();
        let available = self
            .variables
            .iter()
            .map(|&v| (v, self.owned_variables.contains(&v) || self.available_for_read.contains(&v)))
            .collect();
        (values, available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_site(dir: &Path, index: SiteId, vars: &[VariableId], owned: &[VariableId]) -> Site {
        Site::open(index, vars, owned, 0, dir).unwrap()
    }

    #[test]
    fn owned_variable_is_readable_without_any_prior_commit() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[1, 2], &[1]);
        let status = site.try_read(100, 1, None).unwrap().unwrap();
        assert_eq!(status, OperationStatus::Success { variable: 1, value: 10 });
    }

    #[test]
    fn non_owned_even_variable_unreadable_until_first_commit() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.fail();
        site.recover(5);
        assert_eq!(site.try_read(100, 2, None).unwrap(), None);

        site.try_write(100, 2, 22).unwrap();
        site.commit(100, None).unwrap();
        let status = site.try_read(200, 2, None).unwrap().unwrap();
        assert_eq!(status, OperationStatus::Success { variable: 2, value: 22 });
    }

    #[test]
    fn read_returns_own_pending_write() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.try_write(1, 2, 999).unwrap();
        let status = site.try_read(1, 2, None).unwrap().unwrap();
        assert_eq!(status, OperationStatus::Success { variable: 2, value: 999 });
    }

    #[test]
    fn down_site_rejects_read_and_write() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.fail();
        assert_eq!(site.try_read(1, 2, None), Err(SiteDown));
        assert_eq!(site.try_write(1, 2, 1), Err(SiteDown));
    }

    #[test]
    fn snapshot_survives_fail_and_ignores_down_state() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.multiversion_clone(0);
        site.fail();
        let status = site.try_read(1, 2, Some(0)).unwrap().unwrap();
        assert_eq!(status, OperationStatus::Success { variable: 2, value: 20 });
    }

    #[test]
    fn commit_flushes_writes_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.try_write(1, 2, 42).unwrap();
        site.commit(1, None).unwrap();
        assert_eq!(site.store.read(2), Some(42));
        assert!(site.try_write(2, 2, 1).unwrap().is_some());
    }

    #[test]
    fn abort_discards_writes() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.try_write(1, 2, 42).unwrap();
        site.abort(1, None).unwrap();
        assert_eq!(site.store.read(2), Some(20));
    }

    #[test]
    #[should_panic(expected = "is not down")]
    fn recover_while_up_panics() {
        let dir = TempDir::new().unwrap();
        let mut site = open_site(dir.path(), 1, &[2], &[]);
        site.recover(1);
    }
}
