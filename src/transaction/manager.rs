// The top-level command dispatcher: owns all sites and open transactions,
// routes reads/writes across replicas per available-copies, arbitrates
// conflicts with wait-die, and drives the blocked-operation queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::common::{self, SiteId, Tick, TransactionId, VariableId};
use crate::error::{DbError, Result as DbResult};
use crate::transaction::error::{CommandError, CommandResult};
use crate::transaction::site::{Site, SiteDown};
use crate::transaction::types::{BlockedOp, Command, DumpTarget, LogEntry, LogStatus, OperationStatus, TransactionRecord};
use crate::transaction::wait_die::WaitDie;
use crate::Config;

/// Result of a single dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Began { txid: TransactionId },
    BegunReadOnly { txid: TransactionId },
    Read { txid: TransactionId, variable: VariableId, value: i64 },
    Wrote { txid: TransactionId, variable: VariableId, value: i64 },
    Blocked { txid: TransactionId },
    /// The operation's wait-die scan decided this transaction should die
    /// rather than wait or succeed. `alive` is now `false`; the
    /// transaction stays open until its `end` is processed, at which
    /// point it logs as `ABORTED`.
    Killed { txid: TransactionId },
    Ended { txid: TransactionId, status: LogStatus },
    SiteFailed { site: SiteId },
    SiteRecovered { site: SiteId },
    Dump(String),
}

pub type CommandResultOutcome = CommandResult<CommandOutcome>;

/// Owns the full replica set and every open transaction. A single value
/// threaded through the command loop — there is no global singleton.
pub struct TransactionManager {
    sites: Vec<Site>,
    variables: Vec<VariableId>,
    open_tx: HashMap<TransactionId, TransactionRecord>,
    /// Every txid that has ever reached `end`, kept around after removal
    /// from `open_tx` so a second `end` for the same id can be told apart
    /// from ending one that was never begun: double-end is a fatal
    /// protocol violation, not a user-facing unknown-transaction error.
    ended_txids: HashSet<TransactionId>,
    blocked_queue: VecDeque<TransactionId>,
    log: Vec<LogEntry>,
    tick: Tick,
    /// Scratch slot for the value a just-completed `try_read` produced,
    /// since `try_read`'s return is just a done/blocked flag.
    last_read_value: Option<i64>,
}

impl TransactionManager {
    /// Builds the standard 10-site/20-variable topology under
    /// `config.data_dir`, recovering each site's store from disk.
    pub fn new(config: &Config) -> DbResult<Self> {
        if config.num_sites != common::NUM_SITES || config.num_variables != common::NUM_VARIABLES {
            return Err(DbError::Storage(format!(
                "unsupported topology: {} sites / {} variables (this engine is fixed at {}/{})",
                config.num_sites,
                config.num_variables,
                common::NUM_SITES,
                common::NUM_VARIABLES
            )));
        }

        let data_dir = PathBuf::from(&config.data_dir);
        let variables: Vec<VariableId> = (1..=common::NUM_VARIABLES).collect();

        let mut hosted_by_site: HashMap<SiteId, Vec<VariableId>> = HashMap::new();
        let mut owned_by_site: HashMap<SiteId, Vec<VariableId>> = HashMap::new();
        for &variable in &variables {
            for site in common::hosting_sites(variable) {
                hosted_by_site.entry(site).or_default().push(variable);
            }
            if !common::is_even(variable) {
                owned_by_site.entry(common::owning_site(variable)).or_default().push(variable);
            }
        }

        let mut sites = Vec::with_capacity(common::NUM_SITES as usize);
        for index in 1..=common::NUM_SITES {
            let hosted = hosted_by_site.remove(&index).unwrap_or_default();
            let owned = owned_by_site.remove(&index).unwrap_or_default();
            sites.push(Site::open(index, &hosted, &owned, 0, &data_dir)?);
        }

        Ok(Self {
            sites,
            variables,
            open_tx: HashMap::new(),
            ended_txids: HashSet::new(),
            blocked_queue: VecDeque::new(),
            log: Vec::new(),
            tick: 0,
            last_read_value: None,
        })
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn commit_abort_log(&self) -> &[LogEntry] {
        &self.log
    }

    fn site(&self, index: SiteId) -> &Site {
        self.sites
            .iter()
            .find(|s| s.index() == index)
            .unwrap_or_else(|| panic!("site {} does not exist", index))
    }

    fn site_mut(&mut self, index: SiteId) -> &mut Site {
        self.sites
            .iter_mut()
            .find(|s| s.index() == index)
            .unwrap_or_else(|| panic!("site {} does not exist", index))
    }

    fn start_times(&self) -> HashMap<TransactionId, Tick> {
        self.open_tx.iter().map(|(&id, rec)| (id, rec.start_time)).collect()
    }

    /// Advances the tick, retries every blocked transaction's stored
    /// operation in FIFO order, then processes `commands` in order.
    pub fn send_commands(&mut self, commands: &[Command]) -> Vec<CommandResultOutcome> {
        self.tick += 1;
        self.retry_blocked();

        commands.iter().map(|cmd| self.dispatch(cmd)).collect()
    }

    fn retry_blocked(&mut self) {
        let pending: Vec<TransactionId> = self.blocked_queue.iter().copied().collect();
        let mut still_blocked = VecDeque::new();

        for txid in pending {
            // A transaction can vanish from open_tx (terminated via
            // wait-die while blocked) before its own retry runs; treat
            // that as already resolved.
            let op = match self.open_tx.get(&txid).and_then(|r| r.blocked) {
                Some(op) => op,
                None => continue,
            };

            let done = match op {
                BlockedOp::Read { variable } => self.try_read(txid, variable),
                BlockedOp::Write { variable, value } => self.try_write(txid, variable, value),
                BlockedOp::End => self.try_end(txid),
            };

            if done {
                if let Some(record) = self.open_tx.get_mut(&txid) {
                    record.blocked = None;
                }
            } else {
                still_blocked.push_back(txid);
            }
        }

        self.blocked_queue = still_blocked;
    }

    fn dispatch(&mut self, command: &Command) -> CommandResultOutcome {
        match *command {
            Command::Begin(txid) => self.begin(txid, false),
            Command::BeginRo(txid) => self.begin(txid, true),
            Command::Read(txid, variable) => self.dispatch_read(txid, variable),
            Command::Write(txid, variable, value) => self.dispatch_write(txid, variable, value),
            Command::End(txid) => self.dispatch_end(txid),
            Command::Fail(site) => self.dispatch_fail(site),
            Command::Recover(site) => self.dispatch_recover(site),
            Command::Dump(target) => Ok(CommandOutcome::Dump(self.dump(target))),
        }
    }

    fn fail_if_blocked(&self, txid: TransactionId) {
        if let Some(record) = self.open_tx.get(&txid) {
            if let Some(op) = record.blocked {
                panic!(
                    "T{} is blocked on {:?} but received a new command",
                    txid, op
                );
            }
        }
    }

    fn begin(&mut self, txid: TransactionId, is_ro: bool) -> CommandResultOutcome {
        if self.open_tx.contains_key(&txid) {
            return Err(CommandError::DuplicateTransaction(txid));
        }

        if !is_ro {
            let sites: Vec<SiteId> = self.sites.iter().map(|s| s.index()).collect();
            self.open_tx.insert(txid, TransactionRecord::new(txid, self.tick, sites, None));
            info!(txid, tick = self.tick, "started");
            Ok(CommandOutcome::Began { txid })
        } else {
            let up_sites: Vec<SiteId> = self.sites.iter().filter(|s| s.is_up()).map(|s| s.index()).collect();
            let tick = self.tick;
            for &index in &up_sites {
                self.site_mut(index).multiversion_clone(tick);
            }
            self.open_tx
                .insert(txid, TransactionRecord::new(txid, self.tick, up_sites, Some(self.tick)));
            info!(txid, tick = self.tick, "started (read-only)");
            Ok(CommandOutcome::BegunReadOnly { txid })
        }
    }

    fn dispatch_read(&mut self, txid: TransactionId, variable: VariableId) -> CommandResultOutcome {
        if !self.open_tx.contains_key(&txid) {
            return Err(CommandError::UnknownTransaction(txid));
        }
        self.fail_if_blocked(txid);
        if !self.variables.contains(&variable) {
            return Err(CommandError::UnknownVariable(variable));
        }

        self.last_read_value = None;
        if self.try_read(txid, variable) {
            if self.open_tx.get(&txid).map_or(false, |r| r.alive) {
                Ok(CommandOutcome::Read {
                    txid,
                    variable,
                    value: self.last_read_value.take().expect("a live, completed read always sets a value"),
                })
            } else {
                Ok(CommandOutcome::Killed { txid })
            }
        } else {
            self.block(txid, BlockedOp::Read { variable });
            Ok(CommandOutcome::Blocked { txid })
        }
    }

    fn dispatch_write(&mut self, txid: TransactionId, variable: VariableId, value: i64) -> CommandResultOutcome {
        if !self.open_tx.contains_key(&txid) {
            return Err(CommandError::UnknownTransaction(txid));
        }
        self.fail_if_blocked(txid);
        if !self.variables.contains(&variable) {
            return Err(CommandError::UnknownVariable(variable));
        }

        if self.try_write(txid, variable, value) {
            if self.open_tx.get(&txid).map_or(false, |r| r.alive) {
                Ok(CommandOutcome::Wrote { txid, variable, value })
            } else {
                Ok(CommandOutcome::Killed { txid })
            }
        } else {
            self.block(txid, BlockedOp::Write { variable, value });
            Ok(CommandOutcome::Blocked { txid })
        }
    }

    fn dispatch_end(&mut self, txid: TransactionId) -> CommandResultOutcome {
        if !self.open_tx.contains_key(&txid) {
            if self.ended_txids.contains(&txid) {
                panic!("T{} ended already", txid);
            }
            return Err(CommandError::UnknownTransaction(txid));
        }
        self.fail_if_blocked(txid);
        self.open_tx.get_mut(&txid).unwrap().ended = true;

        self.try_end(txid);
        let status = self.log.last().expect("end_transaction always logs").status;
        Ok(CommandOutcome::Ended { txid, status })
    }

    fn dispatch_fail(&mut self, site: SiteId) -> CommandResultOutcome {
        if !self.sites.iter().any(|s| s.index() == site) {
            return Err(CommandError::UnknownSite(site));
        }
        self.site_mut(site).fail();
        warn!(site, "is down");
        Ok(CommandOutcome::SiteFailed { site })
    }

    fn dispatch_recover(&mut self, site: SiteId) -> CommandResultOutcome {
        if !self.sites.iter().any(|s| s.index() == site) {
            return Err(CommandError::UnknownSite(site));
        }
        let tick = self.tick;
        self.site_mut(site).recover(tick);
        info!(site, "is up");
        Ok(CommandOutcome::SiteRecovered { site })
    }

    fn block(&mut self, txid: TransactionId, op: BlockedOp) {
        let record = self.open_tx.get_mut(&txid).expect("txid must be open to block");
        record.blocked = Some(op);
        if !self.blocked_queue.contains(&txid) {
            self.blocked_queue.push_back(txid);
        }
    }

    /// Attempts a read for `txid`. Returns `true` once the transaction is
    /// done with this operation (it succeeded or the transaction died),
    /// `false` if it remains blocked.
    fn try_read(&mut self, txid: TransactionId, variable: VariableId) -> bool {
        let record = self.open_tx.get(&txid).expect("txid must be open");
        if !record.alive {
            return true;
        }
        let ro_tick = record.ro_tick;
        let start_time = record.start_time;
        let sites = record.sites.clone();

        let start_times = self.start_times();
        let mut wait_die = WaitDie::new(&start_times, start_time);
        let mut blocked = false;
        let mut num_down = 0u32;

        for site_idx in &sites {
            match self.site_mut(*site_idx).try_read(txid, variable, ro_tick) {
                Ok(None) => continue,
                Ok(Some(OperationStatus::Success { value, .. })) => {
                    let tick = self.tick;
                    self.open_tx.get_mut(&txid).unwrap().mark_site_accessed(*site_idx, tick);
                    self.last_read_value = Some(value);
                    info!(txid, variable, value, site = site_idx, "read");
                    return true;
                }
                Ok(Some(OperationStatus::Blocked { waits_for, .. })) => {
                    blocked = true;
                    wait_die.append_blockers(&waits_for);
                }
                Err(SiteDown) => num_down += 1,
            }
        }

        if blocked {
            if wait_die.should_die() {
                self.kill(txid);
                true
            } else {
                false
            }
        } else if num_down > 0 {
            false
        } else {
            warn!(txid, variable, "killing; variable not available on any eligible site");
            self.kill(txid);
            true
        }
    }

    /// Attempts a write for `txid` across every eligible site, ignoring
    /// down sites outright (available-copies: absent replicas catch up via
    /// later writes, not this one).
    fn try_write(&mut self, txid: TransactionId, variable: VariableId, value: i64) -> bool {
        let record = self.open_tx.get(&txid).expect("txid must be open");
        if !record.alive {
            return true;
        }
        let start_time = record.start_time;
        let sites = record.sites.clone();

        let start_times = self.start_times();
        let mut wait_die = WaitDie::new(&start_times, start_time);
        let mut blocked = false;
        let mut sites_written = Vec::new();

        for site_idx in &sites {
            match self.site_mut(*site_idx).try_write(txid, variable, value) {
                Ok(None) => continue,
                Ok(Some(OperationStatus::Success { .. })) => {
                    let tick = self.tick;
                    self.open_tx.get_mut(&txid).unwrap().mark_site_accessed(*site_idx, tick);
                    sites_written.push(*site_idx);
                }
                Ok(Some(OperationStatus::Blocked { waits_for, .. })) => {
                    blocked = true;
                    wait_die.append_blockers(&waits_for);
                }
                Err(SiteDown) => {}
            }
        }

        if blocked {
            if wait_die.should_die() {
                self.kill(txid);
                true
            } else {
                false
            }
        } else if !sites_written.is_empty() {
            info!(txid, variable, value, sites = ?sites_written, "wrote");
            true
        } else {
            false
        }
    }

    fn kill(&mut self, txid: TransactionId) {
        self.open_tx.get_mut(&txid).expect("txid must be open").alive = false;
    }

    /// Ends a transaction: always completes — an `end` never actually
    /// blocks — so this returns `true` unconditionally.
    fn try_end(&mut self, txid: TransactionId) -> bool {
        let record = self.open_tx.remove(&txid).expect("ending txid must be open");
        self.ended_txids.insert(txid);
        let is_ro = record.is_read_only();
        let should_commit = record.alive && {
            if is_ro {
                true
            } else {
                // Iterate a snapshot of the transaction's site list; commit
                // and abort mutate site state but must not mutate this.
                record.sites.iter().all(|site_idx| match record.sites_accessed.get(site_idx) {
                    None => true,
                    Some(&accessed_at) => {
                        let site = self.site(*site_idx);
                        site.is_up() && site.up_since().unwrap() <= accessed_at
                    }
                })
            }
        };

        for &site_idx in &record.sites {
            let site = self.site_mut(site_idx);
            if !site.is_up() {
                continue;
            }
            let result = if should_commit {
                site.commit(txid, record.ro_tick)
            } else {
                site.abort(txid, record.ro_tick)
            };
            result.unwrap_or_else(|e| panic!("{} on site {} for T{}: {}", if should_commit { "commit" } else { "abort" }, site_idx, txid, e));
        }

        let status = if should_commit { LogStatus::Committed } else { LogStatus::Aborted };
        info!(txid, ?status, "ended");
        self.log.push(LogEntry {
            txid,
            start_time: record.start_time,
            status,
        });
        true
    }

    fn dump(&self, target: DumpTarget) -> String {
        let variables: Vec<VariableId> = match target {
            DumpTarget::Variable(v) => vec![v],
            _ => self.variables.clone(),
        };
        let site_filter: Box<dyn Fn(&Site) -> bool> = match target {
            DumpTarget::Site(s) => Box::new(move |site: &Site| site.index() == s),
            _ => Box::new(|_: &Site| true),
        };

        let mut out = String::new();
        for site in self.sites.iter().filter(|s| site_filter(s)) {
            let (values, available) = site.dump();
            out.push_str(&format!("S{}:", site.index()));
            for &variable in &variables {
                match values.get(&variable) {
                    Some(value) => {
                        let marker = if *available.get(&variable).unwrap_or(&false) { "" } else { "*" };
                        out.push_str(&format!(" x{}={}{}", variable, value, marker));
                    }
                    None => out.push_str(&format!(" x{}=-", variable)),
                }
            }
            out.push('\n');
        }
        out
    }
}
