use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TxManError};
use crate::log_entry::LogEntryKind;
use crate::paxos::VoteMsg;
use crate::types::{CommId, PaxosGroupId, TransactionGroup, VoteOutcome};

/// Wire-level status codes, mirrored into [`crate::errors::TxManError`]
/// for the kinds that are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    Success,
    Aborted,
    NotFound,
    Timeout,
    UnknownTable,
    SeeErrno,
    Garbage,
    NonePending,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }
}

impl From<&TxManError> for ReturnCode {
    fn from(e: &TxManError) -> ReturnCode {
        match e {
            TxManError::Aborted => ReturnCode::Aborted,
            TxManError::NotFound => ReturnCode::NotFound,
            TxManError::Timeout => ReturnCode::Timeout,
            TxManError::UnknownTable => ReturnCode::UnknownTable,
            TxManError::NonePending => ReturnCode::NonePending,
            TxManError::Garbage(_) => ReturnCode::Garbage,
            TxManError::Storage(_) | TxManError::Serialization(_) => ReturnCode::SeeErrno,
        }
    }
}

/// Commands from the client library. Every command after `Begin` names
/// the transaction group returned by the begin reply, the slot it should
/// occupy, and a nonce for reply routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Begin {
        nonce: u64,
    },
    Read {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
    },
    Write {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
    },
    Commit {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
    },
    Abort {
        tg: TransactionGroup,
        nonce: u64,
        seqno: u64,
    },
}

impl ClientRequest {
    pub fn nonce(&self) -> u64 {
        match self {
            ClientRequest::Begin { nonce }
            | ClientRequest::Read { nonce, .. }
            | ClientRequest::Write { nonce, .. }
            | ClientRequest::Commit { nonce, .. }
            | ClientRequest::Abort { nonce, .. } => *nonce,
        }
    }

    pub fn tg(&self) -> Option<TransactionGroup> {
        match self {
            ClientRequest::Begin { .. } => None,
            ClientRequest::Read { tg, .. }
            | ClientRequest::Write { tg, .. }
            | ClientRequest::Commit { tg, .. }
            | ClientRequest::Abort { tg, .. } => Some(*tg),
        }
    }
}

/// Replies to the client library. Encoded once and cached per slot so a
/// duplicate retry replays the identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    Begin {
        nonce: u64,
        status: ReturnCode,
        tg: Option<TransactionGroup>,
    },
    Read {
        nonce: u64,
        status: ReturnCode,
        value: Option<Bytes>,
    },
    Write {
        nonce: u64,
        status: ReturnCode,
    },
    Commit {
        nonce: u64,
        status: ReturnCode,
    },
    Abort {
        nonce: u64,
        status: ReturnCode,
    },
}

impl ClientResponse {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| TxManError::Serialization(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<ClientResponse> {
        bincode::deserialize(payload).map_err(|e| TxManError::Serialization(e.to_string()))
    }
}

/// Messages between daemons: the per-transaction replicated log, the
/// inter-data-center commit record, the two vote protocols, and client
/// commands a follower forwards to its leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    Paxos2A {
        tg: TransactionGroup,
        seqno: u64,
        kind: LogEntryKind,
        payload: Bytes,
    },
    Paxos2B {
        tg: TransactionGroup,
        seqno: u64,
    },
    CommitRecord {
        tg: TransactionGroup,
        record: Bytes,
    },
    LvVote {
        tg: TransactionGroup,
        msg: VoteMsg<CommId, VoteOutcome>,
    },
    GvPropose {
        tg: TransactionGroup,
        dc: PaxosGroupId,
        outcome: VoteOutcome,
    },
    GvVote {
        tg: TransactionGroup,
        msg: VoteMsg<PaxosGroupId, VoteOutcome>,
    },
    Forwarded {
        origin: CommId,
        req: ClientRequest,
    },
}
