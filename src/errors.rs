use thiserror::Error;

/// Represents the possible errors that can occur within the TxMan
/// transaction coordinator.
///
/// Kinds fall into three categories: locally recovered (retried from the
/// background tick), surfaced to the caller as an aborted transaction,
/// and fatal (logged, with the offending message dropped).
#[derive(Error, Debug)]
pub enum TxManError {
    /// The transaction was aborted, either by an explicit request, a
    /// failed commit vote, or a verify-read mismatch at commit time.
    #[error("transaction aborted")]
    Aborted,

    /// The referenced transaction, slot, or key does not exist.
    #[error("not found")]
    NotFound,

    /// A key-value store call or a peer exchange did not complete in
    /// time. Retried on the next background tick.
    #[error("timed out")]
    Timeout,

    /// The named table is not known to the key-value store.
    #[error("unknown table")]
    UnknownTable,

    /// No operation is pending at the referenced slot.
    #[error("none pending")]
    NonePending,

    /// A corrupt or impossible input: undecodable payloads, log entries
    /// that contradict a durable slot, state transitions that cannot
    /// happen. The message carrying it is dropped.
    #[error("garbage: {0}")]
    Garbage(String),

    /// An error from the durable log beneath the coordinator.
    #[error("storage error: {0}")]
    Storage(String),

    /// An encode or decode failure on a wire or log payload.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A convenient alias for `Result` with [`TxManError`] as the error type.
pub type Result<T> = std::result::Result<T, TxManError>;
