// Core domain types: commands, lock modes, operation results, and the
// transaction record.

use std::collections::{BTreeSet, HashMap};

use crate::common::{SiteId, Tick, TransactionId, VariableId};

/// Lock mode requested against a variable at a single site.
///
/// Deliberately just these two modes — no hierarchical intent-lock scheme
/// (S/X/IS/IX/SIX/U), which this engine has no use for: there is exactly
/// one lockable unit per site (a variable), so no lock escalation
/// hierarchy is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// Result of a `try_read`/`try_write` attempt at one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Success { variable: VariableId, value: i64 },
    Blocked {
        variable: VariableId,
        waits_for: BTreeSet<TransactionId>,
    },
}

/// The command language's data shape: the `(op, args)` tuple an external
/// textual parser is expected to produce. This crate does not include the
/// lexer that turns lines into these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Begin(TransactionId),
    BeginRo(TransactionId),
    Read(TransactionId, VariableId),
    Write(TransactionId, VariableId, i64),
    End(TransactionId),
    Fail(SiteId),
    Recover(SiteId),
    Dump(DumpTarget),
}

/// Restricts a `dump()` to a single variable or site, or the whole matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpTarget {
    All,
    Variable(VariableId),
    Site(SiteId),
}

/// A stored retry for a transaction that returned "blocked".
///
/// An exhaustively matched tag rather than a captured closure: the retry
/// path dispatches on this instead of invoking a stored thunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedOp {
    Read { variable: VariableId },
    Write { variable: VariableId, value: i64 },
    End,
}

/// Outcome of a terminated transaction, as recorded in the commit/abort log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Committed,
    Aborted,
}

/// A single append-only entry in the transaction manager's commit/abort log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub txid: TransactionId,
    pub start_time: Tick,
    pub status: LogStatus,
}

/// Live bookkeeping for one open transaction.
///
/// `sites` holds stable site indices the transaction is eligible to touch,
/// not references into the `TransactionManager`'s site registry: a record
/// borrowing its owner's collection would be a self-reference.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txid: TransactionId,
    pub start_time: Tick,
    pub sites: Vec<SiteId>,
    /// `Some(begin_tick)` for a read-only transaction, `None` for RW.
    pub ro_tick: Option<Tick>,
    /// Turns `false` the moment wait-die kills this transaction.
    pub alive: bool,
    /// Turns `true` once an `end` command has been received.
    pub ended: bool,
    /// Tick of each site's first successful access by this transaction.
    pub sites_accessed: HashMap<SiteId, Tick>,
    /// At most one stored retry: a transaction can only be blocked on the
    /// single command it most recently attempted.
    pub blocked: Option<BlockedOp>,
}

impl TransactionRecord {
    pub fn new(txid: TransactionId, start_time: Tick, sites: Vec<SiteId>, ro_tick: Option<Tick>) -> Self {
        Self {
            txid,
            start_time,
            sites,
            ro_tick,
            alive: true,
            ended: false,
            sites_accessed: HashMap::new(),
            blocked: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.ro_tick.is_some()
    }

    /// Records the tick of `site`'s first successful access. Later
    /// successes do not update it: commit validation needs the earliest
    /// touch, not the latest.
    pub fn mark_site_accessed(&mut self, site: SiteId, tick: Tick) {
        self.sites_accessed.entry(site).or_insert(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_tick_is_sticky() {
        let mut record = TransactionRecord::new(1, 5, vec![1, 2, 3], None);
        record.mark_site_accessed(1, 6);
        record.mark_site_accessed(1, 9);
        assert_eq!(record.sites_accessed.get(&1), Some(&6));
    }

    #[test]
    fn read_only_flag_follows_ro_tick() {
        let rw = TransactionRecord::new(1, 5, vec![1], None);
        let ro = TransactionRecord::new(2, 5, vec![1], Some(5));
        assert!(!rw.is_read_only());
        assert!(ro.is_read_only());
    }
}
