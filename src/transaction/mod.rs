pub mod deadlock;
pub mod lock_manager;
pub mod manager;
pub mod types;

pub use deadlock::WaitForGraph;
pub use lock_manager::{LockManager, DEFAULT_ESCALATION_THRESHOLD};
pub use manager::TransactionManager;
pub use types::{
    IsolationLevel, LockMode, ResourceId, Transaction, TransactionState, UndoRecord,
};
