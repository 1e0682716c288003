// Transaction lifecycle: begin, commit, rollback, savepoints.
//
// Commit protocol: flush every dirty buffer frame, sync the file, then
// transition and release locks; durability before visibility. Rollback
// walks the in-memory change list in reverse, restoring before-images
// through the table heaps; the X locks taken by the original writes are
// still held, so no new locks are needed.

use crate::catalog::Catalog;
use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::disk::DiskManager;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::{
    IsolationLevel, Transaction, TransactionState, UndoRecord,
};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

pub struct TransactionManager {
    next_txn_id: Mutex<TransactionId>,
    active: RwLock<HashMap<TransactionId, Arc<Mutex<Transaction>>>>,
    locks: Arc<LockManager>,
    buffer: Arc<BufferPool>,
    disk: Arc<DiskManager>,
}

impl TransactionManager {
    pub fn new(locks: Arc<LockManager>, buffer: Arc<BufferPool>, disk: Arc<DiskManager>) -> Self {
        Self {
            next_txn_id: Mutex::new(1),
            active: RwLock::new(HashMap::new()),
            locks,
            buffer,
            disk,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn begin(&self, isolation: IsolationLevel) -> TransactionId {
        let txn_id = {
            let mut next = self.next_txn_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let txn = Transaction::new(txn_id, isolation);
        self.active.write().insert(txn_id, Arc::new(Mutex::new(txn)));
        debug!("begin transaction {} ({})", txn_id, isolation);
        txn_id
    }

    pub fn is_active(&self, txn_id: TransactionId) -> bool {
        self.active.read().contains_key(&txn_id)
    }

    pub fn isolation(&self, txn_id: TransactionId) -> Result<IsolationLevel> {
        let txn = self.get(txn_id)?;
        let isolation = txn.lock().isolation;
        Ok(isolation)
    }

    pub fn cancel_flag(&self, txn_id: TransactionId) -> Result<Arc<AtomicBool>> {
        let txn = self.get(txn_id)?;
        let flag = Arc::clone(&txn.lock().cancelled);
        Ok(flag)
    }

    /// Request cancellation; the executing statement observes the flag
    /// between operator `next` calls and unwinds with `Cancelled`.
    pub fn cancel(&self, txn_id: TransactionId) -> Result<()> {
        let flag = self.cancel_flag(txn_id)?;
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Append an undo record to the transaction's change list.
    pub fn push_undo(&self, txn_id: TransactionId, record: UndoRecord) -> Result<()> {
        let txn = self.get(txn_id)?;
        txn.lock().undo.push(record);
        Ok(())
    }

    /// Flush, sync, release. A storage failure in the flush phase aborts
    /// the transaction and surfaces as `CommitFailed`.
    pub fn commit(&self, txn_id: TransactionId, catalog: &Catalog, deadline: Instant) -> Result<()> {
        if self.locks.take_victim(txn_id) {
            self.rollback(txn_id, catalog, deadline)?;
            return Err(DbError::Deadlock(txn_id));
        }
        let txn = self.get(txn_id)?;
        let (read_only, dropped) = {
            let mut txn = txn.lock();
            if txn.state != TransactionState::Active {
                return Err(DbError::TransactionNotActive(txn_id));
            }
            txn.state = TransactionState::Preparing;
            let dropped: Vec<_> = txn
                .undo
                .iter()
                .filter_map(|u| match u {
                    UndoRecord::DropTable { info } => Some(info.clone()),
                    _ => None,
                })
                .collect();
            (txn.undo.is_empty(), dropped)
        };

        // A transaction that wrote nothing has nothing to make durable.
        if !read_only {
            if let Err(e) = self.buffer.flush_all().and_then(|_| self.disk.sync()) {
                warn!("commit flush failed for transaction {}: {}", txn_id, e);
                self.rollback(txn_id, catalog, deadline)?;
                return Err(DbError::CommitFailed(e.to_string()));
            }
        }

        // Dropped tables become unreachable only now that the catalog
        // change is durable; their pages go back to the free list.
        for info in dropped {
            if let Err(e) = catalog.free_table_pages(&info, deadline) {
                warn!("freeing pages of dropped table '{}' failed: {}", info.name, e);
            }
        }

        txn.lock().state = TransactionState::Committed;
        self.active.write().remove(&txn_id);
        self.locks.release_all(txn_id);
        debug!("committed transaction {}", txn_id);
        Ok(())
    }

    /// Undo every change in reverse order, then release locks.
    pub fn rollback(
        &self,
        txn_id: TransactionId,
        catalog: &Catalog,
        deadline: Instant,
    ) -> Result<()> {
        let txn = self.get(txn_id)?;
        let undo: Vec<UndoRecord> = {
            let mut txn = txn.lock();
            txn.savepoint = None;
            std::mem::take(&mut txn.undo)
        };
        let result = self.apply_undo(&undo, catalog, deadline);
        txn.lock().state = TransactionState::Aborted;
        self.active.write().remove(&txn_id);
        self.locks.release_all(txn_id);
        debug!("rolled back transaction {}", txn_id);
        result
    }

    /// Record (or replace) the transaction's savepoint.
    pub fn savepoint(&self, txn_id: TransactionId, name: &str) -> Result<()> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock();
        if txn.state != TransactionState::Active {
            return Err(DbError::TransactionNotActive(txn_id));
        }
        let mark = txn.undo.len();
        txn.savepoint = Some((name.to_lowercase(), mark));
        Ok(())
    }

    /// Undo changes made after the named savepoint. Locks acquired since
    /// the savepoint are retained.
    pub fn rollback_to(
        &self,
        txn_id: TransactionId,
        name: &str,
        catalog: &Catalog,
        deadline: Instant,
    ) -> Result<()> {
        let txn = self.get(txn_id)?;
        let tail: Vec<UndoRecord> = {
            let mut txn = txn.lock();
            let mark = match &txn.savepoint {
                Some((sp_name, mark)) if *sp_name == name.to_lowercase() => *mark,
                _ => return Err(DbError::NoSuchSavepoint(name.to_string())),
            };
            txn.undo.split_off(mark)
        };
        self.apply_undo(&tail, catalog, deadline)
    }

    fn apply_undo(
        &self,
        undo: &[UndoRecord],
        catalog: &Catalog,
        deadline: Instant,
    ) -> Result<()> {
        for record in undo.iter().rev() {
            match record {
                UndoRecord::Insert { table, rid } => {
                    let info = catalog.get_table(table)?;
                    let heap = catalog.table_heap(table, deadline)?;
                    heap.delete(&info.columns, *rid, deadline)?;
                    let _ = catalog.adjust_row_count(table, -1, deadline);
                }
                UndoRecord::Update { table, rid, before } => {
                    let info = catalog.get_table(table)?;
                    let heap = catalog.table_heap(table, deadline)?;
                    heap.update(&info.columns, *rid, before, deadline)?;
                }
                UndoRecord::Delete { table, rid, before } => {
                    let info = catalog.get_table(table)?;
                    let heap = catalog.table_heap(table, deadline)?;
                    heap.restore(&info.columns, *rid, before, deadline)?;
                    let _ = catalog.adjust_row_count(table, 1, deadline);
                }
                UndoRecord::CreateTable { name } => {
                    let info = catalog.drop_table(name, deadline)?;
                    catalog.free_table_pages(&info, deadline)?;
                }
                UndoRecord::DropTable { info } => {
                    catalog.restore_table(info.clone(), deadline)?;
                }
            }
        }
        Ok(())
    }

    fn get(&self, txn_id: TransactionId) -> Result<Arc<Mutex<Transaction>>> {
        self.active
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(DbError::TransactionNotActive(txn_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::common::{DataType, Value};
    use crate::storage::space::SpaceManager;
    use std::time::Duration;
    use tempfile::tempdir;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    struct Fixture {
        txns: TransactionManager,
        catalog: Catalog,
    }

    fn fixture(dir: &tempfile::TempDir) -> Fixture {
        let disk = Arc::new(DiskManager::open(dir.path().join("t.adb"), 4096).unwrap());
        let buffer = Arc::new(BufferPool::new(32, Arc::clone(&disk)));
        let space = Arc::new(SpaceManager::new(Arc::clone(&disk)));
        let catalog = Catalog::open(
            Arc::clone(&disk),
            Arc::clone(&buffer),
            Arc::clone(&space),
            deadline(),
        )
        .unwrap();
        let locks = Arc::new(LockManager::new());
        let txns = TransactionManager::new(locks, buffer, disk);
        Fixture { txns, catalog }
    }

    fn users_table(catalog: &Catalog) {
        catalog
            .create_table(
                "users",
                vec![
                    Column::new("id", DataType::Integer).primary_key(),
                    Column::new("name", DataType::Text),
                ],
                deadline(),
            )
            .unwrap();
    }

    #[test]
    fn test_rollback_of_insert_removes_row() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        users_table(&f.catalog);
        let info = f.catalog.get_table("users").unwrap();
        let heap = f.catalog.table_heap("users", deadline()).unwrap();

        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        let rid = heap
            .insert(
                &info.columns,
                &[Value::Integer(1), Value::Text("Ada".into())],
                deadline(),
            )
            .unwrap();
        f.txns
            .push_undo(txn, UndoRecord::Insert { table: "users".into(), rid })
            .unwrap();
        f.txns.rollback(txn, &f.catalog, deadline()).unwrap();
        assert!(heap.get(&info.columns, rid, deadline()).unwrap().is_none());
        assert!(!f.txns.is_active(txn));
    }

    #[test]
    fn test_rollback_of_update_restores_before_image() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        users_table(&f.catalog);
        let info = f.catalog.get_table("users").unwrap();
        let heap = f.catalog.table_heap("users", deadline()).unwrap();
        let before = vec![Value::Integer(1), Value::Text("Ada".into())];
        let rid = heap.insert(&info.columns, &before, deadline()).unwrap();

        let txn = f.txns.begin(IsolationLevel::RepeatableRead);
        heap.update(
            &info.columns,
            rid,
            &[Value::Integer(1), Value::Text("Grace".into())],
            deadline(),
        )
        .unwrap();
        f.txns
            .push_undo(
                txn,
                UndoRecord::Update {
                    table: "users".into(),
                    rid,
                    before: before.clone(),
                },
            )
            .unwrap();
        f.txns.rollback(txn, &f.catalog, deadline()).unwrap();
        assert_eq!(heap.get(&info.columns, rid, deadline()).unwrap().unwrap(), before);
    }

    #[test]
    fn test_rollback_of_delete_revives_row() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        users_table(&f.catalog);
        let info = f.catalog.get_table("users").unwrap();
        let heap = f.catalog.table_heap("users", deadline()).unwrap();
        let row = vec![Value::Integer(2), Value::Text("Bob".into())];
        let rid = heap.insert(&info.columns, &row, deadline()).unwrap();

        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        heap.delete(&info.columns, rid, deadline()).unwrap();
        f.txns
            .push_undo(
                txn,
                UndoRecord::Delete {
                    table: "users".into(),
                    rid,
                    before: row.clone(),
                },
            )
            .unwrap();
        f.txns.rollback(txn, &f.catalog, deadline()).unwrap();
        assert_eq!(heap.get(&info.columns, rid, deadline()).unwrap().unwrap(), row);
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        users_table(&f.catalog);
        let info = f.catalog.get_table("users").unwrap();
        let heap = f.catalog.table_heap("users", deadline()).unwrap();

        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        let keep = heap
            .insert(&info.columns, &[Value::Integer(1), Value::Null], deadline())
            .unwrap();
        f.txns
            .push_undo(txn, UndoRecord::Insert { table: "users".into(), rid: keep })
            .unwrap();
        f.txns.savepoint(txn, "sp1").unwrap();
        let discard = heap
            .insert(&info.columns, &[Value::Integer(2), Value::Null], deadline())
            .unwrap();
        f.txns
            .push_undo(txn, UndoRecord::Insert { table: "users".into(), rid: discard })
            .unwrap();

        f.txns.rollback_to(txn, "sp1", &f.catalog, deadline()).unwrap();
        assert!(heap.get(&info.columns, keep, deadline()).unwrap().is_some());
        assert!(heap.get(&info.columns, discard, deadline()).unwrap().is_none());
        // The transaction is still active and can commit the kept row.
        f.txns.commit(txn, &f.catalog, deadline()).unwrap();
    }

    #[test]
    fn test_unknown_savepoint_errors() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        assert!(matches!(
            f.txns.rollback_to(txn, "nope", &f.catalog, deadline()),
            Err(DbError::NoSuchSavepoint(_))
        ));
    }

    #[test]
    fn test_commit_releases_locks() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        users_table(&f.catalog);
        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        f.txns
            .lock_manager()
            .acquire(
                txn,
                crate::transaction::types::ResourceId::Table(1),
                crate::transaction::types::LockMode::Exclusive,
                deadline(),
            )
            .unwrap();
        f.txns.commit(txn, &f.catalog, deadline()).unwrap();
        assert_eq!(f.txns.lock_manager().lock_count(txn), 0);
    }

    #[test]
    fn test_double_commit_rejected() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        let txn = f.txns.begin(IsolationLevel::ReadCommitted);
        f.txns.commit(txn, &f.catalog, deadline()).unwrap();
        assert!(matches!(
            f.txns.commit(txn, &f.catalog, deadline()),
            Err(DbError::TransactionNotActive(_))
        ));
    }
}
