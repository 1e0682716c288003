// Core transaction types: isolation levels, lifecycle states, lock
// modes over the resource hierarchy, and the in-memory undo log.

use crate::catalog::TableInfo;
use crate::common::{PageId, RecordId, Row, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// Isolation level, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads take no shared locks; dirty reads possible.
    ReadUncommitted,
    /// Shared lock per row, released after the fetch.
    #[default]
    ReadCommitted,
    /// Shared locks held to commit.
    RepeatableRead,
    /// Repeatable read plus table-level shared locks on scanned ranges.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Lifecycle state. Active → Preparing → Committed, or → Aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionState {
    #[default]
    Active,
    Preparing,
    Committed,
    Aborted,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// Lock mode under the multi-granularity protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The standard compatibility matrix.
    pub fn compatible_with(&self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (IntentionExclusive, _) | (_, IntentionExclusive) => false,
            (Shared, Shared) => true,
            (Shared, _) | (_, Shared) => false,
            _ => false,
        }
    }

    /// Least mode at least as strong as both; the target of an upgrade.
    pub fn combine(self, other: LockMode) -> LockMode {
        use LockMode::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (SharedIntentionExclusive, _) | (_, SharedIntentionExclusive) => {
                SharedIntentionExclusive
            }
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => {
                SharedIntentionExclusive
            }
            (Shared, IntentionShared) | (IntentionShared, Shared) => Shared,
            (IntentionExclusive, IntentionShared) | (IntentionShared, IntentionExclusive) => {
                IntentionExclusive
            }
            _ => Exclusive,
        }
    }

    /// The intention mode to take on ancestors before this mode.
    pub fn intention(&self) -> LockMode {
        match self {
            LockMode::Shared | LockMode::IntentionShared => LockMode::IntentionShared,
            _ => LockMode::IntentionExclusive,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        write!(f, "{}", s)
    }
}

/// Lockable resource. The hierarchy is database → table → page → row;
/// ids rather than references, so the wait graph never owns objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Database,
    Table(u32),
    Page { table: u32, page: PageId },
    Row { table: u32, rid: RecordId },
}

impl ResourceId {
    pub fn parent(&self) -> Option<ResourceId> {
        match self {
            ResourceId::Database => None,
            ResourceId::Table(_) => Some(ResourceId::Database),
            ResourceId::Page { table, .. } => Some(ResourceId::Table(*table)),
            ResourceId::Row { table, rid } => Some(ResourceId::Page {
                table: *table,
                page: rid.page_id,
            }),
        }
    }

    /// The table this resource belongs to, if any.
    pub fn table(&self) -> Option<u32> {
        match self {
            ResourceId::Database => None,
            ResourceId::Table(t) | ResourceId::Page { table: t, .. } | ResourceId::Row { table: t, .. } => {
                Some(*t)
            }
        }
    }

    pub fn is_fine_grained(&self) -> bool {
        matches!(self, ResourceId::Page { .. } | ResourceId::Row { .. })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Database => write!(f, "database"),
            ResourceId::Table(t) => write!(f, "table {}", t),
            ResourceId::Page { table, page } => write!(f, "table {} page {}", table, page),
            ResourceId::Row { table, rid } => write!(f, "table {} row {}", table, rid),
        }
    }
}

/// One entry in a transaction's in-memory change list, holding what is
/// needed to undo the change. A future write-ahead log would subsume
/// this structure.
#[derive(Debug, Clone)]
pub enum UndoRecord {
    Insert {
        table: String,
        rid: RecordId,
    },
    Update {
        table: String,
        rid: RecordId,
        before: Row,
    },
    Delete {
        table: String,
        rid: RecordId,
        before: Row,
    },
    CreateTable {
        name: String,
    },
    DropTable {
        info: TableInfo,
    },
}

/// A transaction. Owned by the transaction manager; the lock manager
/// only ever sees its id.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub isolation: IsolationLevel,
    pub started_at: Instant,
    pub undo: Vec<UndoRecord>,
    /// Single active savepoint: (name, undo length at creation).
    pub savepoint: Option<(String, usize)>,
    pub cancelled: Arc<AtomicBool>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            isolation,
            started_at: Instant::now(),
            undo: Vec::new(),
            savepoint: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}
