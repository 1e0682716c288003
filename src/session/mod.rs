// Session dispatcher: the front door for SQL text.
//
// Pipeline per statement: validate non-empty, lex, parse, resolve,
// optimize, execute inside the session's transaction. With autocommit
// and no open transaction, one is begun implicitly, committed on
// success and rolled back on error. Inside an explicit transaction an
// error leaves the transaction active for the caller to roll back,
// except a deadlock victim, whose transaction is already gone.

pub mod session_manager;

pub use session_manager::{PreparedStatement, Session, SessionManager};

use crate::common::Value;
use crate::error::{DbError, Result};
use crate::execution::{executor, ExecContext, QueryResult};
use crate::sql::parser;
use crate::sql::resolver::{BoundStatement, ResolvedStatement, Resolver, StatementKind};
use crate::DatabaseInner;
use log::warn;
use std::sync::Arc;
use std::time::Instant;

pub(crate) fn dispatch(
    db: &DatabaseInner,
    session: &Arc<Session>,
    sql: &str,
    params: &[Value],
) -> Result<QueryResult> {
    reap_idle(db);
    session.touch();
    if sql.trim().is_empty() {
        return Err(DbError::Syntax {
            message: "empty statement".into(),
            line: 1,
            column: 1,
        });
    }
    let (statements, errors) = parser::parse(sql);
    if let Some(error) = errors.into_iter().next() {
        return Err(error);
    }
    let mut last = QueryResult::empty();
    for statement in &statements {
        let resolved = Resolver::new(&db.catalog).resolve(statement)?;
        last = dispatch_resolved(db, session, &resolved, params)?;
    }
    Ok(last)
}

pub(crate) fn dispatch_resolved(
    db: &DatabaseInner,
    session: &Arc<Session>,
    resolved: &ResolvedStatement,
    params: &[Value],
) -> Result<QueryResult> {
    let started = Instant::now();
    let deadline = started + db.config.query_timeout;
    session.record_query();

    match (&resolved.stmt, resolved.kind) {
        (BoundStatement::Begin, _) => {
            if session.current_txn().is_some() {
                return Err(DbError::Semantic("a transaction is already active".into()));
            }
            let txn = db.txns.begin(session.default_isolation());
            session.set_current_txn(Some(txn));
            Ok(QueryResult::empty())
        }
        (BoundStatement::Commit, _) => {
            let txn = session
                .take_txn()
                .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
            db.txns.commit(txn, &db.catalog, deadline)?;
            Ok(QueryResult::empty())
        }
        (BoundStatement::Rollback { to_savepoint }, _) => match to_savepoint {
            Some(name) => {
                let txn = session
                    .current_txn()
                    .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
                db.txns.rollback_to(txn, name, &db.catalog, deadline)?;
                Ok(QueryResult::empty())
            }
            None => {
                let txn = session
                    .take_txn()
                    .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
                db.txns.rollback(txn, &db.catalog, deadline)?;
                Ok(QueryResult::empty())
            }
        },
        (BoundStatement::Savepoint { name }, _) => {
            let txn = session
                .current_txn()
                .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
            db.txns.savepoint(txn, name)?;
            Ok(QueryResult::empty())
        }
        (_, kind) => {
            let (txn_id, implicit) = match session.current_txn() {
                Some(txn) => (txn, false),
                None => {
                    let txn = db.txns.begin(session.default_isolation());
                    if session.autocommit() {
                        (txn, true)
                    } else {
                        // Autocommit off: the implicit transaction stays
                        // open until an explicit COMMIT or ROLLBACK.
                        session.set_current_txn(Some(txn));
                        (txn, false)
                    }
                }
            };
            let ctx = ExecContext {
                txn_id,
                isolation: db.txns.isolation(txn_id)?,
                catalog: Arc::clone(&db.catalog),
                locks: Arc::clone(db.txns.lock_manager()),
                txns: Arc::clone(&db.txns),
                deadline,
                cancelled: db.txns.cancel_flag(txn_id)?,
                params: params.to_vec(),
            };
            let result = executor::execute_statement(resolved, &ctx);
            let result = match result {
                Ok(result) => {
                    if implicit {
                        db.txns.commit(txn_id, &db.catalog, deadline)?;
                    }
                    Ok(result)
                }
                Err(e) => {
                    if implicit {
                        let _ = db.txns.rollback(txn_id, &db.catalog, deadline);
                    } else if matches!(e, DbError::Deadlock(_)) {
                        // The victim's transaction is dead; don't leave
                        // the session pointing at it.
                        let _ = db.txns.rollback(txn_id, &db.catalog, deadline);
                        session.set_current_txn(None);
                    }
                    Err(e)
                }
            };
            let elapsed = started.elapsed();
            if elapsed > db.config.slow_query_threshold {
                warn!(
                    "slow query ({} ms, kind {:?}) on session {}",
                    elapsed.as_millis(),
                    kind,
                    session.id
                );
            }
            result
        }
    }
}

/// Close idle sessions, rolling back whatever they left open.
fn reap_idle(db: &DatabaseInner) {
    for session in db.sessions.reap_idle() {
        if let Some(txn) = session.take_txn() {
            let deadline = Instant::now() + db.config.query_timeout;
            let _ = db.txns.rollback(txn, &db.catalog, deadline);
            warn!("rolled back transaction of idle session {}", session.id);
        }
    }
}

/// Prepared-statement execution with schema revalidation: a stale
/// compilation is transparently redone from the saved SQL.
pub(crate) fn execute_prepared(
    db: &DatabaseInner,
    session: &Arc<Session>,
    stmt_id: u64,
    params: &[Value],
) -> Result<QueryResult> {
    session.touch();
    let mut prepared = session.prepared(stmt_id)?;
    if prepared.resolved.schema_version != db.catalog.schema_version() {
        let (mut statements, errors) = parser::parse(&prepared.sql);
        if let Some(error) = errors.into_iter().next() {
            return Err(error);
        }
        if statements.len() != 1 {
            return Err(DbError::Semantic(
                "prepared statement must be a single statement".into(),
            ));
        }
        let resolved = Resolver::new(&db.catalog).resolve(&statements.remove(0))?;
        prepared.resolved = resolved;
        session.replace_prepared(stmt_id, prepared.clone());
    }
    if matches!(
        prepared.resolved.kind,
        StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback | StatementKind::Savepoint
    ) {
        return Err(DbError::Semantic(
            "transaction control cannot be prepared".into(),
        ));
    }
    dispatch_resolved(db, session, &prepared.resolved, params)
}
