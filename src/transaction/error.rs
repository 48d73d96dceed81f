// User/command-level errors surfaced by the transaction manager.
//
// These are the only errors that propagate to a caller of `send_commands`
// without aborting the rest of the batch. Protocol violations (double-end,
// unlock not held, a new command for an
// already-blocked transaction, an unknown snapshot token) are programmer
// errors and `panic!` with context instead of returning a `Result` — there
// is no sensible per-command recovery from a bookkeeping bug in the engine
// itself.

use thiserror::Error;

use crate::common::{SiteId, TransactionId, VariableId};

/// A command-level error: reported for the offending command only, with
/// the rest of the batch still processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Cannot begin T{0}; already started")]
    DuplicateTransaction(TransactionId),

    #[error("T{0} is not active")]
    UnknownTransaction(TransactionId),

    #[error("Variable x{0} is not in the database")]
    UnknownVariable(VariableId),

    #[error("Site {0} does not exist")]
    UnknownSite(SiteId),
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
