pub mod config;
pub mod durable_log;
pub mod errors;
pub mod kvs;
pub mod log_entry;
pub mod messages;
pub mod paxos;
pub mod transaction;
pub mod transport;
pub mod txman;
pub mod types;
pub mod voter;

// Re-export key types and structs for easier access
pub use config::{Config, ConfigHandle};
pub use durable_log::{LogStore, RocksLogStore};
pub use errors::{Result, TxManError};
pub use kvs::{KeyValueStore, KvsCompletion, KvsOp, KvsOpKind, KvsRequest};
pub use log_entry::{CommitRecord, LogEntry, LogEntryKind};
pub use messages::{ClientRequest, ClientResponse, PeerMessage, ReturnCode};
pub use transaction::{Transaction, TxState};
pub use transport::Transport;
pub use txman::{Event, TxMan};
pub use types::{
    CommId, PaxosGroup, PaxosGroupId, TransactionGroup, VoteOutcome, MAX_REPLICATION,
};

/// Prelude of the transaction manager.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::durable_log::*;
    pub use crate::errors::*;
    pub use crate::kvs::*;
    pub use crate::log_entry::*;
    pub use crate::messages::*;
    pub use crate::transaction::*;
    pub use crate::transport::*;
    pub use crate::txman::*;
    pub use crate::types::*;
}
