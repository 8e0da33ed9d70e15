use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on the number of data centers that may participate in a
/// single transaction, and on the size of a home group.
pub const MAX_REPLICATION: usize = 5;

/// Identifies a communicating process (a replica daemon or a client).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommId(pub u64);

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm({})", self.0)
    }
}

/// Identifies a Paxos group. Each data center runs one home group, so a
/// group id doubles as the identity of its data center in the global
/// commit protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PaxosGroupId(pub u64);

impl fmt::Display for PaxosGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group({})", self.0)
    }
}

/// A replica set: the group id and its member processes, ordered. The
/// first live member is the group's leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaxosGroup {
    pub id: PaxosGroupId,
    pub members: Vec<CommId>,
}

impl PaxosGroup {
    pub fn new(id: PaxosGroupId, members: Vec<CommId>) -> Self {
        debug_assert!(members.len() <= MAX_REPLICATION);
        Self { id, members }
    }

    /// Majority size for this group.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn contains(&self, id: CommId) -> bool {
        self.members.contains(&id)
    }
}

/// Anchors one transaction to its home Paxos log: the home group id plus
/// the transaction number assigned by the initiating data center.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TransactionGroup {
    pub group: PaxosGroupId,
    pub txid: u64,
}

impl TransactionGroup {
    pub fn new(group: PaxosGroupId, txid: u64) -> Self {
        Self { group, txid }
    }
}

impl fmt::Display for TransactionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn[{}:{}]", self.group.0, self.txid)
    }
}

/// A data center's vote on a transaction, and the decided global outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteOutcome {
    Commit,
    Abort,
}

impl VoteOutcome {
    pub fn is_commit(self) -> bool {
        self == VoteOutcome::Commit
    }
}

impl fmt::Display for VoteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteOutcome::Commit => write!(f, "commit"),
            VoteOutcome::Abort => write!(f, "abort"),
        }
    }
}
