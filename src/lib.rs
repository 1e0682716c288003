// AnchorDB - single-file embedded relational database.
//
// One database is one file: page 0 holds the header, page 1 roots the
// catalog, and everything else is table data reached through an LRU
// buffer pool. SQL goes in through a hand-written lexer, recursive-
// descent parser, resolver, and cost-based optimizer; rows come back
// out of a volcano-style operator tree running under multi-granularity
// two-phase locking.

pub mod catalog;
pub mod common;
pub mod error;
pub mod execution;
pub mod session;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use common::{DataType, RecordId, Row, Value};
pub use error::{DbError, ErrorCode, Result};
pub use execution::QueryResult;
pub use transaction::IsolationLevel;

use catalog::Catalog;
use session::{PreparedStatement, Session, SessionManager};
use sql::parser;
use sql::resolver::Resolver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::buffer::BufferPool;
use storage::disk::DiskManager;
use storage::space::SpaceManager;
use transaction::lock_manager::LockManager;
use transaction::TransactionManager;

/// Database configuration. Page size is fixed at creation and must
/// match on reopen; everything else is per-process.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub page_size: usize,
    pub buffer_pool_pages: usize,
    pub max_sessions: usize,
    pub max_sessions_per_user: usize,
    pub session_idle_timeout: Duration,
    pub query_timeout: Duration,
    pub slow_query_threshold: Duration,
    pub data_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            buffer_pool_pages: 1024,
            max_sessions: 100,
            max_sessions_per_user: 10,
            session_idle_timeout: Duration::from_secs(300),
            query_timeout: Duration::from_secs(30),
            slow_query_threshold: Duration::from_secs(1),
            data_dir: PathBuf::from("./data"),
        }
    }
}

pub(crate) struct DatabaseInner {
    pub(crate) config: DbConfig,
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) buffer: Arc<BufferPool>,
    #[allow(dead_code)]
    pub(crate) space: Arc<SpaceManager>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) txns: Arc<TransactionManager>,
    pub(crate) sessions: SessionManager,
}

/// Handle to one open database file. Cheap to clone; all clones share
/// the same engine.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) the database at `path`. A relative path is
    /// placed under the configured data directory.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Database> {
        let path = path.as_ref();
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            config.data_dir.join(path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + config.query_timeout;
        let disk = Arc::new(DiskManager::open(&resolved, config.page_size)?);
        let buffer = Arc::new(BufferPool::new(
            config.buffer_pool_pages,
            Arc::clone(&disk),
        ));
        let space = Arc::new(SpaceManager::new(Arc::clone(&disk)));
        let catalog = Arc::new(Catalog::open(
            Arc::clone(&disk),
            Arc::clone(&buffer),
            Arc::clone(&space),
            deadline,
        )?);
        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(
            locks,
            Arc::clone(&buffer),
            Arc::clone(&disk),
        ));
        let sessions = SessionManager::new(
            config.max_sessions,
            config.max_sessions_per_user,
            config.session_idle_timeout,
        );
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                config,
                disk,
                buffer,
                space,
                catalog,
                txns,
                sessions,
            }),
        })
    }

    pub fn connect(&self) -> Result<SessionHandle> {
        self.connect_as("default")
    }

    pub fn connect_as(&self, user: &str) -> Result<SessionHandle> {
        let session = self.inner.sessions.connect(user, "main")?;
        Ok(SessionHandle {
            db: Arc::clone(&self.inner),
            session,
        })
    }

    /// Flush all dirty pages and sync the file.
    pub fn close(&self) -> Result<()> {
        self.inner.buffer.flush_all()?;
        self.inner.disk.close()
    }

    pub fn buffer_stats(&self) -> storage::BufferPoolStats {
        self.inner.buffer.stats()
    }
}

/// One connection. Statements execute under the session's transaction
/// state; with autocommit (the default), each statement gets its own.
pub struct SessionHandle {
    db: Arc<DatabaseInner>,
    session: Arc<Session>,
}

impl SessionHandle {
    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        session::dispatch(&self.db, &self.session, sql, &[])
    }

    pub fn execute_with_params(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        session::dispatch(&self.db, &self.session, sql, params)
    }

    /// Begin an explicit transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        if self.session.current_txn().is_some() {
            return Err(DbError::Semantic("a transaction is already active".into()));
        }
        let txn = self.db.txns.begin(isolation);
        self.session.set_current_txn(Some(txn));
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let txn = self
            .session
            .take_txn()
            .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
        let deadline = Instant::now() + self.db.config.query_timeout;
        self.db.txns.commit(txn, &self.db.catalog, deadline)
    }

    pub fn rollback(&self) -> Result<()> {
        let txn = self
            .session
            .take_txn()
            .ok_or_else(|| DbError::Semantic("no active transaction".into()))?;
        let deadline = Instant::now() + self.db.config.query_timeout;
        self.db.txns.rollback(txn, &self.db.catalog, deadline)
    }

    /// Compile and retain a statement; `?` placeholders become
    /// positional parameters for `execute_prepared`.
    pub fn prepare(&self, sql: &str) -> Result<u64> {
        self.session.touch();
        let (mut statements, errors) = parser::parse(sql);
        if let Some(error) = errors.into_iter().next() {
            return Err(error);
        }
        if statements.len() != 1 {
            return Err(DbError::Semantic(
                "prepared statement must be a single statement".into(),
            ));
        }
        let resolved = Resolver::new(&self.db.catalog).resolve(&statements.remove(0))?;
        Ok(self.session.store_prepared(PreparedStatement {
            sql: sql.to_string(),
            resolved,
        }))
    }

    pub fn execute_prepared(&self, stmt: u64, params: &[Value]) -> Result<QueryResult> {
        session::execute_prepared(&self.db, &self.session, stmt, params)
    }

    pub fn set_autocommit(&self, on: bool) {
        self.session.set_autocommit(on);
    }

    pub fn set_default_isolation(&self, isolation: IsolationLevel) {
        self.session.set_default_isolation(isolation);
    }

    pub fn session_id(&self) -> common::SessionId {
        self.session.id
    }

    /// Roll back any open transaction and release the session slot.
    pub fn close(self) -> Result<()> {
        self.end_session()
    }

    fn end_session(&self) -> Result<()> {
        if let Some(txn) = self.session.take_txn() {
            let deadline = Instant::now() + self.db.config.query_timeout;
            let _ = self.db.txns.rollback(txn, &self.db.catalog, deadline);
        }
        self.db.sessions.close(self.session.id);
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.end_session();
    }
}
