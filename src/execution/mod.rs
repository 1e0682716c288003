pub mod executor;
pub mod expressions;
pub mod operators;
pub mod optimizer;
pub mod plan;
pub mod sort;

pub use executor::execute_statement;
pub use operators::Operator;
pub use optimizer::optimize;
pub use plan::{PhysicalPlan, Plan, PlanOp};

use crate::catalog::Catalog;
use crate::common::{DataType, Row, TransactionId, Value};
use crate::error::{DbError, Result};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::IsolationLevel;
use crate::transaction::TransactionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Everything an executing statement needs: the enclosing transaction,
/// the shared engine services, the query deadline, and bound parameter
/// values.
pub struct ExecContext {
    pub txn_id: TransactionId,
    pub isolation: IsolationLevel,
    pub catalog: Arc<Catalog>,
    pub locks: Arc<LockManager>,
    pub txns: Arc<TransactionManager>,
    pub deadline: Instant,
    pub cancelled: Arc<AtomicBool>,
    pub params: Vec<Value>,
}

impl ExecContext {
    /// Cooperative cancellation point, checked between row productions.
    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(DbError::Cancelled);
        }
        if Instant::now() > self.deadline {
            return Err(DbError::QueryTimeout);
        }
        Ok(())
    }
}

/// Result of one statement: rows for SELECT, an affected-row count for
/// DML, both empty for DDL and transaction control.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub column_types: Vec<Option<DataType>>,
    pub rows: Vec<Row>,
    pub rows_affected: usize,
}

impl QueryResult {
    pub fn with_rows(
        columns: Vec<String>,
        column_types: Vec<Option<DataType>>,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            columns,
            column_types,
            rows,
            rows_affected: 0,
        }
    }

    pub fn with_affected(rows_affected: usize) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}
