use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;

use crate::errors::{Result, TxManError};
use crate::types::{PaxosGroupId, TransactionGroup, VoteOutcome};

/// The daemon's persisted state: every Paxos entry accepted durably at
/// `(transaction-group, seqno)`, plus the decided global outcome per
/// transaction. Replayed at startup to recover in-flight transactions.
pub trait LogStore: Send + Sync {
    fn put_entry(&self, tg: TransactionGroup, seqno: u64, entry: &[u8]) -> Result<()>;
    fn get_entry(&self, tg: TransactionGroup, seqno: u64) -> Result<Option<Vec<u8>>>;
    /// All persisted entries of one transaction, in seqno order.
    fn scan(&self, tg: TransactionGroup) -> Result<Vec<(u64, Vec<u8>)>>;
    fn put_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) -> Result<()>;
    fn get_decision(&self, tg: TransactionGroup) -> Result<Option<VoteOutcome>>;
    /// Every transaction group with at least one persisted entry.
    fn groups(&self) -> Result<Vec<TransactionGroup>>;
}

const ENTRY_PREFIX: u8 = b'e';
const DECISION_PREFIX: u8 = b'd';

fn entry_key(tg: TransactionGroup, seqno: u64) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = ENTRY_PREFIX;
    key[1..9].copy_from_slice(&tg.group.0.to_be_bytes());
    key[9..17].copy_from_slice(&tg.txid.to_be_bytes());
    key[17..25].copy_from_slice(&seqno.to_be_bytes());
    key
}

fn decision_key(tg: TransactionGroup) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = DECISION_PREFIX;
    key[1..9].copy_from_slice(&tg.group.0.to_be_bytes());
    key[9..17].copy_from_slice(&tg.txid.to_be_bytes());
    key
}

fn split_entry_key(key: &[u8]) -> Option<(TransactionGroup, u64)> {
    if key.len() != 25 || key[0] != ENTRY_PREFIX {
        return None;
    }
    let group = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let txid = u64::from_be_bytes(key[9..17].try_into().ok()?);
    let seqno = u64::from_be_bytes(key[17..25].try_into().ok()?);
    Some((TransactionGroup::new(PaxosGroupId(group), txid), seqno))
}

/// [`LogStore`] over a local RocksDB instance. Entry payloads are stored
/// exactly as they travel on the wire; keys are big-endian so one
/// transaction's entries are contiguous and ordered for the scans.
pub struct RocksLogStore {
    db: DB,
}

impl RocksLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| TxManError::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

impl LogStore for RocksLogStore {
    fn put_entry(&self, tg: TransactionGroup, seqno: u64, entry: &[u8]) -> Result<()> {
        self.db
            .put(entry_key(tg, seqno), entry)
            .map_err(|e| TxManError::Storage(e.to_string()))
    }

    fn get_entry(&self, tg: TransactionGroup, seqno: u64) -> Result<Option<Vec<u8>>> {
        self.db
            .get(entry_key(tg, seqno))
            .map_err(|e| TxManError::Storage(e.to_string()))
    }

    fn scan(&self, tg: TransactionGroup) -> Result<Vec<(u64, Vec<u8>)>> {
        let start = entry_key(tg, 0);
        let mut out = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| TxManError::Storage(e.to_string()))?;
            match split_entry_key(&key) {
                Some((found, seqno)) if found == tg => out.push((seqno, value.to_vec())),
                _ => break,
            }
        }
        Ok(out)
    }

    fn put_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) -> Result<()> {
        let encoded =
            bincode::serialize(&outcome).map_err(|e| TxManError::Serialization(e.to_string()))?;
        self.db
            .put(decision_key(tg), encoded)
            .map_err(|e| TxManError::Storage(e.to_string()))
    }

    fn get_decision(&self, tg: TransactionGroup) -> Result<Option<VoteOutcome>> {
        let value = self
            .db
            .get(decision_key(tg))
            .map_err(|e| TxManError::Storage(e.to_string()))?;
        match value {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| TxManError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn groups(&self) -> Result<Vec<TransactionGroup>> {
        let mut out: Vec<TransactionGroup> = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&[ENTRY_PREFIX], Direction::Forward))
        {
            let (key, _) = item.map_err(|e| TxManError::Storage(e.to_string()))?;
            match split_entry_key(&key) {
                Some((tg, _)) => {
                    if out.last() != Some(&tg) {
                        out.push(tg);
                    }
                }
                None => break,
            }
        }
        Ok(out)
    }
}
