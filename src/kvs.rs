use bytes::Bytes;
use crossbeam_channel::Sender;

use crate::messages::ReturnCode;
use crate::types::TransactionGroup;

/// Discriminates key-value store calls and their completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvsOpKind {
    Lock,
    Unlock,
    Read,
    Write,
    VerifyRead,
    VerifyWrite,
}

/// One call against the key-value service. Reads, writes, and both
/// verifies are timestamped with the transaction's commit-ordering
/// value; locks are owned by the transaction group.
#[derive(Debug, Clone)]
pub enum KvsOp {
    Lock { table: Bytes, key: Bytes },
    Unlock { table: Bytes, key: Bytes },
    Read { table: Bytes, key: Bytes, timestamp: u64 },
    Write { table: Bytes, key: Bytes, timestamp: u64, value: Bytes },
    VerifyRead { table: Bytes, key: Bytes, timestamp: u64 },
    VerifyWrite { table: Bytes, key: Bytes, timestamp: u64 },
}

impl KvsOp {
    pub fn kind(&self) -> KvsOpKind {
        match self {
            KvsOp::Lock { .. } => KvsOpKind::Lock,
            KvsOp::Unlock { .. } => KvsOpKind::Unlock,
            KvsOp::Read { .. } => KvsOpKind::Read,
            KvsOp::Write { .. } => KvsOpKind::Write,
            KvsOp::VerifyRead { .. } => KvsOpKind::VerifyRead,
            KvsOp::VerifyWrite { .. } => KvsOpKind::VerifyWrite,
        }
    }
}

/// A call tagged with the slot it belongs to, so the completion routes
/// back to the right operation of the right transaction.
#[derive(Debug, Clone)]
pub struct KvsRequest {
    pub tg: TransactionGroup,
    pub seqno: u64,
    pub op: KvsOp,
}

/// The asynchronous result of a [`KvsRequest`]. `timestamp` and `value`
/// carry the observed version for reads and verifies and are zero/empty
/// otherwise.
#[derive(Debug, Clone)]
pub struct KvsCompletion {
    pub tg: TransactionGroup,
    pub seqno: u64,
    pub kind: KvsOpKind,
    pub rc: ReturnCode,
    pub timestamp: u64,
    pub value: Option<Bytes>,
}

/// Contract of the underlying key-value service.
///
/// Calls complete asynchronously by sending a [`KvsCompletion`] on the
/// provided channel; an implementation must never invoke the coordinator
/// synchronously from `submit`. Every call may be retried by the
/// background tick and therefore must be idempotent: locking a key the
/// same transaction already holds succeeds, writing the same value at
/// the same timestamp is a no-op, and unlocking an unheld key succeeds.
pub trait KeyValueStore: Send + Sync {
    fn submit(&self, req: KvsRequest, done: &Sender<KvsCompletion>);
}
