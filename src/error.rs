use thiserror::Error;

use crate::table::CellId;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the transaction engine.
///
/// All variants are recoverable at the point of detection: the engine rejects
/// the offending message or operation and keeps the shared table consistent.
/// Invariant breakage (ref-count underflow, bucket/cell cross-linkage
/// corruption) is *not* represented here; see [`invariant_violation`].
#[derive(Error, Debug)]
pub enum Error {
    /// The configured transaction capacity is exhausted; the new transaction
    /// was rejected. The caller should answer 500 upstream when a response is
    /// structurally possible.
    #[error("transaction capacity exhausted")]
    CapacityExhausted,

    /// The per-transaction branch limit was reached.
    #[error("branch limit reached for transaction {0}")]
    TooManyBranches(CellId),

    /// A mandatory header needed for matching is missing or unusable.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// The message is well-formed but not acceptable in its context
    /// (e.g. an ACK without a prior INVITE transaction). Discarded, logged.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// No transaction with the given identity is linked in the table.
    #[error("transaction not found: {0}")]
    TransactionNotFound(CellId),

    /// The requested operation is not valid in the transaction's current
    /// state (e.g. adding a branch after the branch set was frozen).
    #[error("invalid transaction state: {0}")]
    InvalidState(&'static str),

    /// Error reported by the transport collaborator while sending.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration rejected at engine construction.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Other miscellaneous errors.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

/// Terminates the process on a broken engine invariant.
///
/// The hash table and the cells are shared by every worker; continuing after
/// a ref-count underflow or a linkage mismatch would let the corruption
/// spread to all of them. Recovery is not attempted.
#[cold]
pub(crate) fn invariant_violation(what: &str) -> ! {
    tracing::error!(invariant = what, "transaction engine state corrupted, aborting");
    panic!("transaction engine invariant violated: {what}");
}
