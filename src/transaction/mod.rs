// The concurrency-control and replication engine: per-site lock manager,
// per-site store-backed `Site`, wait-die arbitration, and the top-level
// `TransactionManager` command dispatcher.

pub mod error;
pub mod lock_manager;
pub mod manager;
pub mod site;
pub mod types;
pub mod wait_die;

pub use error::{CommandError, CommandResult};
pub use lock_manager::LockManager;
pub use manager::{CommandOutcome, TransactionManager};
pub use site::{Site, SiteDown};
pub use types::{
    BlockedOp, Command, DumpTarget, LockMode, LogEntry, LogStatus, OperationStatus,
    TransactionRecord,
};
pub use wait_die::WaitDie;
