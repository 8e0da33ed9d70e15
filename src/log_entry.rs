use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TxManError};
use crate::types::{PaxosGroup, PaxosGroupId, TransactionGroup, VoteOutcome};

/// Discriminates log entries on the wire. The derived order doubles as
/// the precedence used to resolve competing proposals for the same
/// non-durable slot: the higher kind wins, so an abort racing a prepare
/// at the same seqno resolves toward abort on every replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LogEntryKind {
    Begin,
    Read,
    Write,
    Prepare,
    Abort,
}

/// One slot of a transaction's replicated log.
///
/// `Begin` is only ever valid at seqno 0; `Prepare` and `Abort` are
/// terminal and mutually exclusive. Payload slices are [`Bytes`] views
/// into the wire buffer they arrived in, so the slot keeps the backing
/// storage alive until it is collected or re-serialized into a commit
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Begin {
        timestamp: u64,
        group: PaxosGroup,
        dcs: Vec<PaxosGroupId>,
    },
    Read {
        table: Bytes,
        key: Bytes,
    },
    Write {
        table: Bytes,
        key: Bytes,
        value: Bytes,
    },
    Prepare,
    Abort,
}

impl LogEntry {
    pub fn kind(&self) -> LogEntryKind {
        match self {
            LogEntry::Begin { .. } => LogEntryKind::Begin,
            LogEntry::Read { .. } => LogEntryKind::Read,
            LogEntry::Write { .. } => LogEntryKind::Write,
            LogEntry::Prepare => LogEntryKind::Prepare,
            LogEntry::Abort => LogEntryKind::Abort,
        }
    }

    /// Prepare and abort close the log; nothing is valid past them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LogEntry::Prepare | LogEntry::Abort)
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TxManError::Serialization(e.to_string()))
    }

    /// Decodes a persisted entry whose kind is not known up front
    /// (recovery replay).
    pub fn decode_any(payload: &[u8]) -> Result<LogEntry> {
        bincode::deserialize(payload).map_err(|e| TxManError::Serialization(e.to_string()))
    }

    /// Decodes a wire payload, checking that it matches the kind the
    /// envelope claimed. A mismatch is corruption, not a protocol state.
    pub fn decode(kind: LogEntryKind, payload: &[u8]) -> Result<LogEntry> {
        let entry: LogEntry = bincode::deserialize(payload)
            .map_err(|e| TxManError::Serialization(e.to_string()))?;
        if entry.kind() != kind {
            return Err(TxManError::Garbage(format!(
                "entry kind {:?} does not match envelope kind {:?}",
                entry.kind(),
                kind
            )));
        }
        Ok(entry)
    }
}

/// Deterministic winner between two proposals contending for the same
/// non-durable slot. Every replica applies the same rule, so the group
/// converges on one entry without extra rounds: higher kind first, then
/// the smaller canonical encoding.
pub fn proposal_wins(challenger: (LogEntryKind, &[u8]), incumbent: (LogEntryKind, &[u8])) -> bool {
    if challenger.0 != incumbent.0 {
        return challenger.0 > incumbent.0;
    }
    challenger.1 < incumbent.1
}

/// A read as recorded in a commit record: the origin's observed
/// timestamp and value, which remote data centers verify against their
/// own replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRead {
    pub seqno: u64,
    pub table: Bytes,
    pub key: Bytes,
    pub timestamp: u64,
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedWrite {
    pub seqno: u64,
    pub table: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// The serialized form of a finished local log, shipped between data
/// centers: the begin header, every durable read and write, the terminal
/// entry, and the originating data center's local vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub tg: TransactionGroup,
    pub timestamp: u64,
    pub group: PaxosGroup,
    pub dcs: Vec<PaxosGroupId>,
    pub reads: Vec<RecordedRead>,
    pub writes: Vec<RecordedWrite>,
    pub terminal_seqno: u64,
    pub terminal: LogEntryKind,
    pub origin_vote: VoteOutcome,
}

impl CommitRecord {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TxManError::Serialization(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<CommitRecord> {
        let record: CommitRecord = bincode::deserialize(payload)
            .map_err(|e| TxManError::Serialization(e.to_string()))?;
        if record.terminal != LogEntryKind::Prepare && record.terminal != LogEntryKind::Abort {
            return Err(TxManError::Garbage(format!(
                "commit record terminal is {:?}",
                record.terminal
            )));
        }
        Ok(record)
    }
}
