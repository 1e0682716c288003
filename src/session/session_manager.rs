// Session registry: connection caps, per-user caps, idle-timeout
// reaping, and per-session state (current transaction, variables,
// prepared statements).

use crate::common::{SessionId, TransactionId};
use crate::error::{DbError, Result};
use crate::sql::resolver::ResolvedStatement;
use crate::transaction::types::IsolationLevel;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A compiled statement retained by a session. Revalidated against the
/// catalog's schema version at execution and recompiled from the
/// original SQL when stale.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: String,
    pub resolved: ResolvedStatement,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub database: String,
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    autocommit: AtomicBool,
    default_isolation: Mutex<IsolationLevel>,
    current_txn: Mutex<Option<TransactionId>>,
    variables: Mutex<HashMap<String, String>>,
    prepared: Mutex<HashMap<u64, PreparedStatement>>,
    next_stmt_id: AtomicU64,
    query_count: AtomicU64,
}

impl Session {
    fn new(id: SessionId, user: String, database: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user,
            database,
            connected_at: now,
            last_activity: Mutex::new(now),
            autocommit: AtomicBool::new(true),
            default_isolation: Mutex::new(IsolationLevel::default()),
            current_txn: Mutex::new(None),
            variables: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            next_stmt_id: AtomicU64::new(1),
            query_count: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.last_activity.lock();
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Relaxed)
    }

    pub fn set_autocommit(&self, on: bool) {
        self.autocommit.store(on, Ordering::Relaxed);
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        *self.default_isolation.lock()
    }

    pub fn set_default_isolation(&self, isolation: IsolationLevel) {
        *self.default_isolation.lock() = isolation;
    }

    pub fn current_txn(&self) -> Option<TransactionId> {
        *self.current_txn.lock()
    }

    pub fn set_current_txn(&self, txn: Option<TransactionId>) {
        *self.current_txn.lock() = txn;
    }

    /// Atomically take the current transaction, if any.
    pub fn take_txn(&self) -> Option<TransactionId> {
        self.current_txn.lock().take()
    }

    pub fn set_variable(&self, name: &str, value: String) {
        self.variables.lock().insert(name.to_lowercase(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.variables.lock().get(&name.to_lowercase()).cloned()
    }

    pub fn store_prepared(&self, stmt: PreparedStatement) -> u64 {
        let id = self.next_stmt_id.fetch_add(1, Ordering::Relaxed);
        self.prepared.lock().insert(id, stmt);
        id
    }

    pub fn prepared(&self, id: u64) -> Result<PreparedStatement> {
        self.prepared
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("prepared statement {}", id)))
    }

    pub fn replace_prepared(&self, id: u64, stmt: PreparedStatement) {
        self.prepared.lock().insert(id, stmt);
    }

    pub fn record_query(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }
}

pub struct SessionManager {
    max_sessions: usize,
    max_sessions_per_user: usize,
    idle_timeout: Duration,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(max_sessions: usize, max_sessions_per_user: usize, idle_timeout: Duration) -> Self {
        Self {
            max_sessions,
            max_sessions_per_user,
            idle_timeout,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, user: &str, database: &str) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(DbError::TooManySessions);
        }
        let per_user = sessions.values().filter(|s| s.user == user).count();
        if per_user >= self.max_sessions_per_user {
            return Err(DbError::TooManySessions);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, user.to_string(), database.to_string()));
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    pub fn close(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Remove sessions idle past the timeout. The caller owns rolling
    /// back any transaction a reaped session still holds.
    pub fn reap_idle(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.idle_for() > self.idle_timeout)
            .map(|s| s.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }
}
