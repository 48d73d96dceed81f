// Wait-die arbitration for one blocked attempt: an oldest-blocker tracker
// scanned across sites, deciding whether the caller should wait or die.

use std::collections::{BTreeSet, HashMap};

use crate::common::{Tick, TransactionId};

/// Tracks the single oldest blocker seen across a scan, to decide whether
/// the caller transaction should wait for it or abort ("die").
pub struct WaitDie<'a> {
    start_times: &'a HashMap<TransactionId, Tick>,
    caller_start: Tick,
    oldest_blocker: Option<(Tick, TransactionId)>,
}

impl<'a> WaitDie<'a> {
    pub fn new(start_times: &'a HashMap<TransactionId, Tick>, caller_start: Tick) -> Self {
        Self {
            start_times,
            caller_start,
            oldest_blocker: None,
        }
    }

    /// Folds a newly observed blocker set into the running oldest-blocker.
    /// Ties on start time favor whichever blocker compares smaller by
    /// txid, matching `min()` over `(start_time, txid)` pairs.
    pub fn append_blockers(&mut self, waits_for: &BTreeSet<TransactionId>) {
        let candidate = waits_for
            .iter()
            .map(|&txid| {
                let start = *self
                    .start_times
                    .get(&txid)
                    .unwrap_or_else(|| panic!("blocker T{} has no open transaction record", txid));
                (start, txid)
            })
            .min()
            .expect("waits_for must be non-empty");

        match self.oldest_blocker {
            Some(current) if current <= candidate => {}
            _ => self.oldest_blocker = Some(candidate),
        }
    }

    /// True iff the caller is younger than the oldest blocker: younger
    /// asks, older holds, so the caller dies.
    pub fn should_die(&self) -> bool {
        let (oldest_start, _) = self.oldest_blocker.expect("should_die() called with no blockers");
        self.caller_start > oldest_start
    }

    pub fn blocked_by(&self) -> TransactionId {
        self.oldest_blocker.expect("blocked_by() called with no blockers").1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_times(pairs: &[(TransactionId, Tick)]) -> HashMap<TransactionId, Tick> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn younger_caller_dies_to_older_blocker() {
        let starts = start_times(&[(1, 10), (2, 20)]);
        let mut wd = WaitDie::new(&starts, 20);
        wd.append_blockers(&BTreeSet::from([1]));
        assert!(wd.should_die());
        assert_eq!(wd.blocked_by(), 1);
    }

    #[test]
    fn older_caller_waits_for_younger_blocker() {
        let starts = start_times(&[(1, 10), (2, 20)]);
        let mut wd = WaitDie::new(&starts, 10);
        wd.append_blockers(&BTreeSet::from([2]));
        assert!(!wd.should_die());
    }

    #[test]
    fn tracks_oldest_blocker_across_multiple_appends() {
        let starts = start_times(&[(1, 10), (2, 5), (3, 30)]);
        let mut wd = WaitDie::new(&starts, 7);
        wd.append_blockers(&BTreeSet::from([1]));
        wd.append_blockers(&BTreeSet::from([2, 3]));
        assert_eq!(wd.blocked_by(), 2);
        assert!(wd.should_die());
    }
}
