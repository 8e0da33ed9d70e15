#![allow(unused)]
//! Common utilities and mock collaborators for TxMan integration tests.
//!
//! Provides an in-memory log store, a versioned mock key-value service
//! with a real per-key lock table, and a deterministic multi-node
//! cluster harness that queues every message and pumps them to
//! completion without threads.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use txman::{
    ClientRequest, ClientResponse, CommId, Config, Event, KeyValueStore, KvsCompletion, KvsOp,
    KvsRequest, LogStore, PaxosGroup, PaxosGroupId, PeerMessage, ReturnCode, Result,
    TransactionGroup, Transport, TxMan, VoteOutcome,
};

/// The client identity used by every test.
pub const CLIENT: CommId = CommId(900);

/// Installs the logger once per test binary; later calls no-op.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

// --- MemLogStore ---

/// In-memory [`LogStore`], shared between a node and its restarted
/// incarnation in recovery tests.
#[derive(Default)]
pub struct MemLogStore {
    entries: Mutex<BTreeMap<(u64, u64, u64), Vec<u8>>>,
    decisions: Mutex<HashMap<(u64, u64), VoteOutcome>>,
}

impl MemLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl LogStore for MemLogStore {
    fn put_entry(&self, tg: TransactionGroup, seqno: u64, entry: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .insert((tg.group.0, tg.txid, seqno), entry.to_vec());
        Ok(())
    }

    fn get_entry(&self, tg: TransactionGroup, seqno: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&(tg.group.0, tg.txid, seqno)).cloned())
    }

    fn scan(&self, tg: TransactionGroup) -> Result<Vec<(u64, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .range((tg.group.0, tg.txid, 0)..=(tg.group.0, tg.txid, u64::MAX))
            .map(|((_, _, seqno), bytes)| (*seqno, bytes.clone()))
            .collect())
    }

    fn put_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) -> Result<()> {
        self.decisions.lock().insert((tg.group.0, tg.txid), outcome);
        Ok(())
    }

    fn get_decision(&self, tg: TransactionGroup) -> Result<Option<VoteOutcome>> {
        Ok(self.decisions.lock().get(&(tg.group.0, tg.txid)).copied())
    }

    fn groups(&self) -> Result<Vec<TransactionGroup>> {
        let mut out: Vec<TransactionGroup> = Vec::new();
        for (group, txid, _) in self.entries.lock().keys() {
            let tg = TransactionGroup::new(PaxosGroupId(*group), *txid);
            if out.last() != Some(&tg) {
                out.push(tg);
            }
        }
        Ok(out)
    }
}

// --- MockKvs ---

type TableKey = (Bytes, Bytes);

#[derive(Default)]
struct KvsInner {
    /// Versions per key, each `(timestamp, value)`, unordered.
    versions: HashMap<TableKey, Vec<(u64, Bytes)>>,
    /// Real mutual exclusion: key -> owning transaction.
    locks: HashMap<TableKey, TransactionGroup>,
    /// Writes that actually landed (idempotent duplicates excluded).
    applied: Vec<(Bytes, Bytes, u64, Bytes)>,
    unlocks: Vec<(Bytes, Bytes, TransactionGroup)>,
    lock_calls: Vec<(TransactionGroup, u64)>,
}

/// A versioned key-value service for one data center. Calls complete
/// synchronously into the caller's completion channel, which the harness
/// drains explicitly, so the asynchrony of the real service is modelled
/// without threads.
#[derive(Default)]
pub struct MockKvs {
    inner: Mutex<KvsInner>,
}

impl MockKvs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, table: &str, key: &str, timestamp: u64, value: &str) {
        self.inner
            .lock()
            .versions
            .entry((b(table), b(key)))
            .or_default()
            .push((timestamp, b(value)));
    }

    /// The latest version visible at `timestamp`.
    fn visible(versions: &[(u64, Bytes)], timestamp: u64) -> Option<(u64, Bytes)> {
        versions
            .iter()
            .filter(|(ts, _)| *ts <= timestamp)
            .max_by_key(|(ts, _)| *ts)
            .cloned()
    }

    pub fn latest(&self, table: &str, key: &str) -> Option<(u64, Bytes)> {
        let inner = self.inner.lock();
        let versions = inner.versions.get(&(b(table), b(key)))?;
        Self::visible(versions, u64::MAX)
    }

    pub fn held_locks(&self) -> usize {
        self.inner.lock().locks.len()
    }

    pub fn applied_writes(&self) -> Vec<(Bytes, Bytes, u64, Bytes)> {
        self.inner.lock().applied.clone()
    }

    pub fn unlock_count(&self) -> usize {
        self.inner.lock().unlocks.len()
    }

    pub fn lock_calls_for(&self, tg: TransactionGroup, seqno: u64) -> usize {
        self.inner
            .lock()
            .lock_calls
            .iter()
            .filter(|(t, s)| *t == tg && *s == seqno)
            .count()
    }
}

impl KeyValueStore for MockKvs {
    fn submit(&self, req: KvsRequest, done: &crossbeam_channel::Sender<KvsCompletion>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let kind = req.op.kind();
        let (rc, timestamp, value) = match req.op {
            KvsOp::Lock { table, key } => {
                inner.lock_calls.push((req.tg, req.seqno));
                let owner = inner.locks.get(&(table.clone(), key.clone())).copied();
                match owner {
                    Some(owner) if owner != req.tg => (ReturnCode::Timeout, 0, None),
                    _ => {
                        inner.locks.insert((table, key), req.tg);
                        (ReturnCode::Success, 0, None)
                    }
                }
            }
            KvsOp::Unlock { table, key } => {
                if inner.locks.get(&(table.clone(), key.clone())) == Some(&req.tg) {
                    inner.locks.remove(&(table.clone(), key.clone()));
                    inner.unlocks.push((table, key, req.tg));
                }
                (ReturnCode::Success, 0, None)
            }
            KvsOp::Read { table, key, timestamp }
            | KvsOp::VerifyRead { table, key, timestamp } => {
                let versions = inner.versions.get(&(table, key));
                match versions.and_then(|v| Self::visible(v, timestamp)) {
                    Some((ts, value)) => (ReturnCode::Success, ts, Some(value)),
                    None => (ReturnCode::NotFound, 0, None),
                }
            }
            KvsOp::Write { table, key, timestamp, value } => {
                let versions = inner
                    .versions
                    .entry((table.clone(), key.clone()))
                    .or_default();
                if !versions.iter().any(|(ts, v)| *ts == timestamp && *v == value) {
                    versions.push((timestamp, value.clone()));
                    inner.applied.push((table, key, timestamp, value));
                }
                (ReturnCode::Success, timestamp, None)
            }
            KvsOp::VerifyWrite { table, key, timestamp } => {
                let versions = inner.versions.get(&(table, key));
                match versions.and_then(|v| Self::visible(v, timestamp)) {
                    Some((ts, value)) => (ReturnCode::Success, ts, Some(value)),
                    None => (ReturnCode::NotFound, 0, None),
                }
            }
        };
        let _ = done.send(KvsCompletion { tg: req.tg, seqno: req.seqno, kind, rc, timestamp, value });
    }
}

// --- Loopback network ---

/// Shared queue standing in for the transport: sends enqueue, the
/// cluster pump delivers, nothing ever re-enters a daemon synchronously.
#[derive(Default)]
pub struct Net {
    queue: Mutex<VecDeque<(CommId, CommId, PeerMessage)>>,
    replies: Mutex<Vec<(CommId, Bytes)>>,
    down: Mutex<HashSet<CommId>>,
}

impl Net {
    pub fn is_down(&self, id: CommId) -> bool {
        self.down.lock().contains(&id)
    }

    pub fn set_down(&self, id: CommId, down: bool) {
        if down {
            self.down.lock().insert(id);
        } else {
            self.down.lock().remove(&id);
        }
    }

    /// Drains and decodes every client reply seen so far.
    pub fn take_replies(&self) -> Vec<(CommId, ClientResponse)> {
        self.replies
            .lock()
            .drain(..)
            .map(|(to, bytes)| {
                let response = ClientResponse::decode(&bytes).expect("undecodable reply");
                (to, response)
            })
            .collect()
    }

    /// Drains the raw reply bytes (for bit-identical comparisons).
    pub fn take_raw_replies(&self) -> Vec<(CommId, Bytes)> {
        self.replies.lock().drain(..).collect()
    }
}

pub struct LoopbackTransport {
    us: CommId,
    net: Arc<Net>,
}

impl LoopbackTransport {
    pub fn new(us: CommId, net: Arc<Net>) -> Self {
        Self { us, net }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, to: CommId, msg: PeerMessage) {
        self.net.queue.lock().push_back((self.us, to, msg));
    }

    fn reply(&self, to: CommId, response: Bytes) {
        self.net.replies.lock().push((to, response));
    }
}

// --- Cluster harness ---

pub struct Node {
    pub id: CommId,
    pub dc: PaxosGroupId,
    pub config: Config,
    pub log: Arc<MemLogStore>,
    pub d: Arc<TxMan>,
}

/// A deterministic multi-data-center cluster. Daemons are driven by
/// calling their dispatch directly; `pump` delivers queued peer messages
/// and drains key-value completions until everything settles.
pub struct Cluster {
    pub net: Arc<Net>,
    pub nodes: Vec<Node>,
    pub groups: Vec<PaxosGroup>,
    pub kvs: HashMap<PaxosGroupId, Arc<MockKvs>>,
}

impl Cluster {
    /// `replicas_per_dc[i]` replicas in data center `i`; comm ids are
    /// assigned sequentially starting at 1.
    pub fn new(replicas_per_dc: &[usize]) -> Self {
        init_logging();
        let net = Arc::new(Net::default());
        let mut groups = Vec::new();
        let mut next = 1u64;
        for (i, count) in replicas_per_dc.iter().enumerate() {
            let members = (0..*count).map(|_| {
                let id = CommId(next);
                next += 1;
                id
            });
            groups.push(PaxosGroup::new(PaxosGroupId(i as u64 + 1), members.collect()));
        }
        let mut kvs = HashMap::new();
        for group in &groups {
            kvs.insert(group.id, MockKvs::new());
        }
        let mut nodes = Vec::new();
        for group in &groups {
            for member in &group.members {
                let config = Config {
                    us: *member,
                    home: group.clone(),
                    groups: groups.clone(),
                    offline: Vec::new(),
                    collect_after_ticks: 2,
                };
                let log = MemLogStore::new();
                let transport = Arc::new(LoopbackTransport { us: *member, net: net.clone() });
                let d = TxMan::new(
                    config.clone(),
                    log.clone(),
                    kvs[&group.id].clone(),
                    transport,
                );
                nodes.push(Node { id: *member, dc: group.id, config, log, d });
            }
        }
        Self { net, nodes, groups, kvs }
    }

    pub fn node(&self, id: CommId) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("unknown node")
    }

    pub fn leader_of(&self, dc_index: usize) -> CommId {
        self.groups[dc_index].members[0]
    }

    pub fn dc(&self, dc_index: usize) -> &Arc<MockKvs> {
        &self.kvs[&self.groups[dc_index].id]
    }

    /// Delivers a client command and pumps the cluster to quiescence.
    pub fn client(&self, to: CommId, req: ClientRequest) {
        self.node(to).d.handle(Event::Client { from: CLIENT, req });
        self.pump();
    }

    /// Delivers queued messages and drains key-value completions until
    /// nothing moves.
    pub fn pump(&self) {
        loop {
            for node in &self.nodes {
                if !self.net.is_down(node.id) {
                    node.d.drain_kvs();
                }
            }
            let next = self.net.queue.lock().pop_front();
            match next {
                Some((from, to, msg)) => {
                    if !self.net.is_down(from) && !self.net.is_down(to) {
                        self.node(to).d.handle(Event::Peer { from, msg });
                    }
                }
                None => {
                    for node in &self.nodes {
                        if !self.net.is_down(node.id) {
                            node.d.drain_kvs();
                        }
                    }
                    if self.net.queue.lock().is_empty() {
                        break;
                    }
                }
            }
        }
    }

    /// One background tick on every live node, then a pump.
    pub fn tick(&self) {
        for node in &self.nodes {
            if !self.net.is_down(node.id) {
                node.d.handle(Event::Tick);
            }
        }
        self.pump();
    }

    /// Installs a new offline list on every node's configuration.
    pub fn set_offline(&self, offline: Vec<CommId>) {
        for node in &self.nodes {
            let mut config = node.config.clone();
            config.offline = offline.clone();
            node.d.reconfigure(config);
        }
    }

    /// Runs a begin on `leader` and returns the assigned group. Drains
    /// the reply queue.
    pub fn begin(&self, leader: CommId) -> TransactionGroup {
        self.client(leader, ClientRequest::Begin { nonce: 1 });
        for (_, response) in self.net.take_replies() {
            if let ClientResponse::Begin { status: ReturnCode::Success, tg: Some(tg), .. } = response
            {
                return tg;
            }
        }
        panic!("begin produced no successful reply");
    }
}
