// Multi-granularity lock manager.
//
// One latch guards the lock table, the per-transaction lock sets, and
// the wait-for graph; critical sections stay short and never span I/O.
// A request incompatible with current holders parks on the resource's
// wait queue and inserts wait edges; every insertion runs cycle
// detection synchronously, wounding the youngest transaction on any
// cycle found. Escalation replaces a pile of fine-grained locks under
// one table with a single table lock when it can be granted
// immediately; failure to escalate is not an error.

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::transaction::deadlock::WaitForGraph;
use crate::transaction::types::{LockMode, ResourceId};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// Fine-grained locks a transaction may hold under one table before
/// escalation is attempted.
pub const DEFAULT_ESCALATION_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: Vec<(TransactionId, LockMode)>,
    waiters: VecDeque<LockRequest>,
}

impl LockEntry {
    fn held_by(&self, txn_id: TransactionId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(t, _)| *t == txn_id)
            .map(|(_, m)| *m)
    }

    fn compatible_for(&self, txn_id: TransactionId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .all(|(t, m)| *t == txn_id || mode.compatible_with(*m))
    }

    fn blockers(&self, txn_id: TransactionId, mode: LockMode) -> Vec<TransactionId> {
        self.holders
            .iter()
            .filter(|(t, m)| *t != txn_id && !mode.compatible_with(*m))
            .map(|(t, _)| *t)
            .collect()
    }
}

struct LockState {
    table: HashMap<ResourceId, LockEntry>,
    txn_locks: HashMap<TransactionId, HashMap<ResourceId, LockMode>>,
    graph: WaitForGraph,
    victims: HashSet<TransactionId>,
}

pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    escalation_threshold: usize,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_ESCALATION_THRESHOLD)
    }

    pub fn with_threshold(escalation_threshold: usize) -> Self {
        Self {
            state: Mutex::new(LockState {
                table: HashMap::new(),
                txn_locks: HashMap::new(),
                graph: WaitForGraph::new(),
                victims: HashSet::new(),
            }),
            cond: Condvar::new(),
            escalation_threshold: escalation_threshold.max(1),
        }
    }

    /// Acquire `mode` on `resource`, blocking until compatible or until
    /// `deadline`. Upgrades the transaction's existing hold when one
    /// exists. Returns `Deadlock` if this transaction is wounded while
    /// waiting, `LockTimeout` on deadline expiry.
    pub fn acquire(
        &self,
        txn_id: TransactionId,
        resource: ResourceId,
        mode: LockMode,
        deadline: Instant,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if resource.is_fine_grained() {
            self.try_escalate(&mut state, txn_id, resource);
        }
        loop {
            if state.victims.remove(&txn_id) {
                self.abandon_wait(&mut state, txn_id, resource);
                self.cond.notify_all();
                return Err(DbError::Deadlock(txn_id));
            }

            let (held, target) = {
                let entry = state.table.entry(resource).or_default();
                let held = entry.held_by(txn_id);
                (held, held.map_or(mode, |h| h.combine(mode)))
            };
            if held == Some(target) {
                self.abandon_wait(&mut state, txn_id, resource);
                return Ok(());
            }
            let compatible = state
                .table
                .get(&resource)
                .map_or(true, |e| e.compatible_for(txn_id, target));
            if compatible {
                let entry = state.table.entry(resource).or_default();
                match entry.holders.iter_mut().find(|(t, _)| *t == txn_id) {
                    Some(holder) => holder.1 = target,
                    None => entry.holders.push((txn_id, target)),
                }
                entry.waiters.retain(|r| r.txn_id != txn_id);
                state
                    .txn_locks
                    .entry(txn_id)
                    .or_default()
                    .insert(resource, target);
                state.graph.clear_waiter(txn_id);
                return Ok(());
            }

            // Park on the wait queue and record who blocks us.
            let blockers = {
                let entry = state.table.get_mut(&resource).expect("entry");
                if !entry.waiters.iter().any(|r| r.txn_id == txn_id) {
                    entry.waiters.push_back(LockRequest { txn_id, mode: target });
                }
                entry.blockers(txn_id, target)
            };
            state.graph.set_waits_for(txn_id, blockers);

            if let Some(cycle) = state.graph.find_cycle(txn_id) {
                let victim = WaitForGraph::choose_victim(&cycle);
                warn!(
                    "deadlock among {:?}; wounding transaction {}",
                    cycle, victim
                );
                if victim == txn_id {
                    state.victims.remove(&txn_id);
                    self.abandon_wait(&mut state, txn_id, resource);
                    self.cond.notify_all();
                    return Err(DbError::Deadlock(txn_id));
                }
                state.victims.insert(victim);
                state.graph.remove_txn(victim);
                self.cond.notify_all();
            }

            if self.cond.wait_until(&mut state, deadline).timed_out() {
                self.abandon_wait(&mut state, txn_id, resource);
                return Err(DbError::LockTimeout(resource.to_string()));
            }
        }
    }

    /// Release one lock and wake waiters that may now be compatible.
    pub fn release(&self, txn_id: TransactionId, resource: ResourceId) {
        let mut state = self.state.lock();
        self.remove_hold(&mut state, txn_id, resource);
        self.cond.notify_all();
    }

    /// Release everything a transaction holds or waits for. Called at
    /// commit and abort.
    pub fn release_all(&self, txn_id: TransactionId) {
        let mut state = self.state.lock();
        let resources: Vec<ResourceId> = state
            .txn_locks
            .remove(&txn_id)
            .map(|locks| locks.keys().copied().collect())
            .unwrap_or_default();
        for resource in resources {
            if let Some(entry) = state.table.get_mut(&resource) {
                entry.holders.retain(|(t, _)| *t != txn_id);
                if entry.holders.is_empty() && entry.waiters.is_empty() {
                    state.table.remove(&resource);
                }
            }
        }
        for entry in state.table.values_mut() {
            entry.waiters.retain(|r| r.txn_id != txn_id);
        }
        state.table.retain(|_, e| !e.holders.is_empty() || !e.waiters.is_empty());
        state.graph.remove_txn(txn_id);
        state.victims.remove(&txn_id);
        self.cond.notify_all();
        debug!("released all locks of transaction {}", txn_id);
    }

    /// Periodic sweep: mark and return one victim per wait-for cycle.
    /// Detection also runs synchronously on every wait-edge insertion,
    /// so this is belt-and-braces, not load-bearing.
    pub fn detect_deadlock(&self) -> Vec<TransactionId> {
        let mut state = self.state.lock();
        let mut victims = Vec::new();
        for cycle in state.graph.cycles() {
            let victim = WaitForGraph::choose_victim(&cycle);
            state.victims.insert(victim);
            state.graph.remove_txn(victim);
            victims.push(victim);
        }
        if !victims.is_empty() {
            self.cond.notify_all();
        }
        victims
    }

    /// Check-and-clear the victim flag; the transaction manager calls
    /// this so a wounded transaction that is not waiting still observes
    /// its fate at its next commit or acquisition.
    pub fn take_victim(&self, txn_id: TransactionId) -> bool {
        self.state.lock().victims.remove(&txn_id)
    }

    /// Current mode held on a resource, if any.
    pub fn held_mode(&self, txn_id: TransactionId, resource: ResourceId) -> Option<LockMode> {
        self.state
            .lock()
            .table
            .get(&resource)
            .and_then(|e| e.held_by(txn_id))
    }

    pub fn locks_of(&self, txn_id: TransactionId) -> Vec<(ResourceId, LockMode)> {
        self.state
            .lock()
            .txn_locks
            .get(&txn_id)
            .map(|locks| locks.iter().map(|(r, m)| (*r, *m)).collect())
            .unwrap_or_default()
    }

    pub fn lock_count(&self, txn_id: TransactionId) -> usize {
        self.state
            .lock()
            .txn_locks
            .get(&txn_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Acquire `mode` on a resource together with the intention locks
    /// its ancestors require, top-down.
    pub fn acquire_hierarchy(
        &self,
        txn_id: TransactionId,
        resource: ResourceId,
        mode: LockMode,
        deadline: Instant,
    ) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut cursor = resource.parent();
        while let Some(ancestor) = cursor {
            ancestors.push(ancestor);
            cursor = ancestor.parent();
        }
        let intention = mode.intention();
        for ancestor in ancestors.into_iter().rev() {
            self.acquire(txn_id, ancestor, intention, deadline)?;
        }
        self.acquire(txn_id, resource, mode, deadline)
    }

    /// If the transaction already holds a table-level lock covering the
    /// requested fine-grained access, or holds more than the threshold
    /// of fine locks under the table, try to escalate. Only escalates
    /// when the table lock is grantable immediately.
    fn try_escalate(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        txn_id: TransactionId,
        resource: ResourceId,
    ) {
        let table = match resource.table() {
            Some(t) => t,
            None => return,
        };
        let fine: Vec<(ResourceId, LockMode)> = match state.txn_locks.get(&txn_id) {
            Some(locks) => locks
                .iter()
                .filter(|(r, _)| r.is_fine_grained() && r.table() == Some(table))
                .map(|(r, m)| (*r, *m))
                .collect(),
            None => return,
        };
        if fine.len() < self.escalation_threshold {
            return;
        }
        let wants_write = fine
            .iter()
            .any(|(_, m)| !matches!(m, LockMode::Shared | LockMode::IntentionShared));
        let table_mode = if wants_write {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let table_res = ResourceId::Table(table);
        let entry = state.table.entry(table_res).or_default();
        let held = entry.held_by(txn_id);
        let target = held.map_or(table_mode, |h| h.combine(table_mode));
        if !entry.compatible_for(txn_id, target) {
            return; // keep the fine-grained locks
        }
        let entry = state.table.get_mut(&table_res).expect("entry");
        match entry.holders.iter_mut().find(|(t, _)| *t == txn_id) {
            Some(holder) => holder.1 = target,
            None => entry.holders.push((txn_id, target)),
        }
        state
            .txn_locks
            .entry(txn_id)
            .or_default()
            .insert(table_res, target);
        for (fine_res, _) in fine {
            self.remove_hold(state, txn_id, fine_res);
        }
        self.cond.notify_all();
        debug!(
            "escalated transaction {} to {} on table {}",
            txn_id, target, table
        );
    }

    fn remove_hold(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        txn_id: TransactionId,
        resource: ResourceId,
    ) {
        if let Some(entry) = state.table.get_mut(&resource) {
            entry.holders.retain(|(t, _)| *t != txn_id);
            if entry.holders.is_empty() && entry.waiters.is_empty() {
                state.table.remove(&resource);
            }
        }
        if let Some(locks) = state.txn_locks.get_mut(&txn_id) {
            locks.remove(&resource);
            if locks.is_empty() {
                state.txn_locks.remove(&txn_id);
            }
        }
    }

    fn abandon_wait(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        txn_id: TransactionId,
        resource: ResourceId,
    ) {
        if let Some(entry) = state.table.get_mut(&resource) {
            entry.waiters.retain(|r| r.txn_id != txn_id);
            if entry.holders.is_empty() && entry.waiters.is_empty() {
                state.table.remove(&resource);
            }
        }
        state.graph.clear_waiter(txn_id);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
