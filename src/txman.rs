use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_skiplist::SkipMap;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{Config, ConfigHandle};
use crate::durable_log::LogStore;
use crate::kvs::{KeyValueStore, KvsCompletion, KvsRequest};
use crate::log_entry::CommitRecord;
use crate::messages::{ClientRequest, ClientResponse, PeerMessage};
use crate::paxos::VoteMsg;
use crate::transaction::Transaction;
use crate::transport::Transport;
use crate::types::{CommId, PaxosGroup, PaxosGroupId, TransactionGroup, VoteOutcome};
use crate::voter::{GlobalVoter, LocalVoter};

/// One unit of work for the daemon: an input from any of the four
/// sources feeding the per-transaction state machines, or a background
/// tick.
pub enum Event {
    Client { from: CommId, req: ClientRequest },
    Peer { from: CommId, msg: PeerMessage },
    Kvs(KvsCompletion),
    Tick,
    Shutdown,
}

/// The transaction-manager daemon.
///
/// Owns the concurrent map of live transactions and the two voter maps,
/// the durable log, and the handles to the external collaborators. A
/// fixed pool of worker threads drains the event channel and re-enters
/// the mutex-guarded state machines; a background thread injects ticks
/// that retry anything outstanding and age out finished transactions.
///
/// Handlers receive `&TxMan` explicitly; transactions never point back
/// at the daemon, so there is no ownership cycle to manage.
pub struct TxMan {
    config: ConfigHandle,
    transactions: SkipMap<TransactionGroup, Arc<Transaction>>,
    local_voters: SkipMap<TransactionGroup, Arc<LocalVoter>>,
    global_voters: SkipMap<TransactionGroup, Arc<GlobalVoter>>,
    log: Arc<dyn LogStore>,
    kvs: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    clock: AtomicU64,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    kvs_tx: Sender<KvsCompletion>,
    kvs_rx: Receiver<KvsCompletion>,
    workers: AtomicUsize,
    stopping: AtomicBool,
}

impl TxMan {
    /// Creates a daemon over the given cluster view and collaborators,
    /// replaying any transactions found in the durable log before
    /// returning.
    ///
    /// The daemon is inert until [`TxMan::start`] spawns the worker
    /// pool, or until events are pushed through [`TxMan::handle`]
    /// directly (which is how the tests drive it).
    ///
    /// # Arguments
    ///
    /// * `config` - The initial cluster view from the coordinator
    ///   service.
    /// * `log` - The durable log for accepted Paxos entries and
    ///   decision records.
    /// * `kvs` - The underlying key-value service.
    /// * `transport` - The outbound message capability; it must queue
    ///   and never call back into the daemon synchronously.
    ///
    /// # Returns
    ///
    /// A new `TxMan` instance with every logged transaction recovered.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use txman::prelude::*;
    ///
    /// # use bytes::Bytes;
    /// # use crossbeam_channel::Sender;
    /// # use parking_lot::Mutex;
    /// # use std::collections::BTreeMap;
    /// # struct MemLog {
    /// #     entries: Mutex<BTreeMap<(TransactionGroup, u64), Vec<u8>>>,
    /// #     decisions: Mutex<BTreeMap<TransactionGroup, VoteOutcome>>,
    /// # }
    /// # impl LogStore for MemLog {
    /// #     fn put_entry(&self, tg: TransactionGroup, seqno: u64, entry: &[u8]) -> Result<()> {
    /// #         self.entries.lock().insert((tg, seqno), entry.to_vec());
    /// #         Ok(())
    /// #     }
    /// #     fn get_entry(&self, tg: TransactionGroup, seqno: u64) -> Result<Option<Vec<u8>>> {
    /// #         Ok(self.entries.lock().get(&(tg, seqno)).cloned())
    /// #     }
    /// #     fn scan(&self, tg: TransactionGroup) -> Result<Vec<(u64, Vec<u8>)>> {
    /// #         Ok(self
    /// #             .entries
    /// #             .lock()
    /// #             .range((tg, 0)..=(tg, u64::MAX))
    /// #             .map(|((_, seqno), bytes)| (*seqno, bytes.clone()))
    /// #             .collect())
    /// #     }
    /// #     fn put_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) -> Result<()> {
    /// #         self.decisions.lock().insert(tg, outcome);
    /// #         Ok(())
    /// #     }
    /// #     fn get_decision(&self, tg: TransactionGroup) -> Result<Option<VoteOutcome>> {
    /// #         Ok(self.decisions.lock().get(&tg).copied())
    /// #     }
    /// #     fn groups(&self) -> Result<Vec<TransactionGroup>> {
    /// #         let mut out: Vec<TransactionGroup> =
    /// #             self.entries.lock().keys().map(|(tg, _)| *tg).collect();
    /// #         out.dedup();
    /// #         Ok(out)
    /// #     }
    /// # }
    /// # struct NullKvs;
    /// # impl KeyValueStore for NullKvs {
    /// #     fn submit(&self, req: KvsRequest, done: &Sender<KvsCompletion>) {
    /// #         let _ = done.send(KvsCompletion {
    /// #             tg: req.tg,
    /// #             seqno: req.seqno,
    /// #             kind: req.op.kind(),
    /// #             rc: ReturnCode::Success,
    /// #             timestamp: 0,
    /// #             value: None,
    /// #         });
    /// #     }
    /// # }
    /// # struct NullTransport;
    /// # impl Transport for NullTransport {
    /// #     fn send(&self, _to: CommId, _msg: PeerMessage) {}
    /// #     fn reply(&self, _to: CommId, _response: Bytes) {}
    /// # }
    /// let home = PaxosGroup::new(PaxosGroupId(1), vec![CommId(1)]);
    /// let config = Config {
    ///     us: CommId(1),
    ///     home: home.clone(),
    ///     groups: vec![home],
    ///     offline: Vec::new(),
    ///     collect_after_ticks: 4,
    /// };
    /// # let log = Arc::new(MemLog {
    /// #     entries: Mutex::new(BTreeMap::new()),
    /// #     decisions: Mutex::new(BTreeMap::new()),
    /// # });
    /// let d = TxMan::new(config, log, Arc::new(NullKvs), Arc::new(NullTransport));
    /// let handles = d.start(4, std::time::Duration::from_millis(100));
    /// # drop(handles);
    /// ```
    pub fn new(
        config: Config,
        log: Arc<dyn LogStore>,
        kvs: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = unbounded();
        let (kvs_tx, kvs_rx) = unbounded();
        let d = Arc::new(Self {
            config: ConfigHandle::new(config),
            transactions: SkipMap::new(),
            local_voters: SkipMap::new(),
            global_voters: SkipMap::new(),
            log,
            kvs,
            transport,
            clock: AtomicU64::new(0),
            events_tx,
            events_rx,
            kvs_tx,
            kvs_rx,
            workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        });
        d.recover();
        d
    }

    /// Replays the durable log: every transaction group with persisted
    /// entries comes back as a live state machine, re-proposing its
    /// entries to the home group from the next tick.
    fn recover(&self) {
        let config = self.config.snapshot();
        let groups = match self.log.groups() {
            Ok(groups) => groups,
            Err(e) => {
                error!("cannot enumerate durable log: {}", e);
                return;
            }
        };
        for tg in groups {
            let entries = match self.log.scan(tg) {
                Ok(entries) => entries,
                Err(e) => {
                    error!("{}: cannot replay durable log: {}", tg, e);
                    continue;
                }
            };
            let decision = self.log.get_decision(tg).unwrap_or_else(|e| {
                error!("{}: cannot read decision record: {}", tg, e);
                None
            });
            debug!("{}: recovered {} entries", tg, entries.len());
            let txn = Arc::new(Transaction::recover(tg, &config, entries, decision));
            self.transactions.insert(tg, txn);
        }
    }

    /// Spawns the worker pool and the tick thread.
    pub fn start(self: &Arc<Self>, workers: usize, tick_every: Duration) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        self.workers.store(workers, Ordering::SeqCst);
        for _ in 0..workers {
            let d = Arc::clone(self);
            handles.push(thread::spawn(move || d.worker_loop()));
        }
        let d = Arc::clone(self);
        handles.push(thread::spawn(move || {
            while !d.stopping.load(Ordering::SeqCst) {
                thread::sleep(tick_every);
                if d.events_tx.send(Event::Tick).is_err() {
                    break;
                }
            }
        }));
        handles
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.workers.load(Ordering::SeqCst) {
            let _ = self.events_tx.send(Event::Shutdown);
        }
    }

    fn worker_loop(&self) {
        loop {
            crossbeam_channel::select! {
                recv(self.events_rx) -> ev => match ev {
                    Ok(Event::Shutdown) | Err(_) => break,
                    Ok(ev) => self.handle(ev),
                },
                recv(self.kvs_rx) -> c => match c {
                    Ok(c) => self.handle(Event::Kvs(c)),
                    Err(_) => break,
                },
            }
        }
    }

    /// Queues an event for the worker pool.
    pub fn enqueue(&self, ev: Event) {
        let _ = self.events_tx.send(ev);
    }

    /// Synchronous dispatch; the worker pool funnels here, and the test
    /// harness drives it directly.
    pub fn handle(&self, ev: Event) {
        match ev {
            Event::Client { from, req } => self.handle_client(from, req, true),
            Event::Peer { from, msg } => self.handle_peer(from, msg),
            Event::Kvs(c) => self.handle_kvs(c),
            Event::Tick => self.tick(),
            Event::Shutdown => {}
        }
    }

    /// Drains completed key-value calls without waiting for a worker.
    pub fn drain_kvs(&self) {
        while let Ok(c) = self.kvs_rx.try_recv() {
            self.handle_kvs(c);
        }
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    fn handle_client(&self, from: CommId, req: ClientRequest, may_forward: bool) {
        let config = self.config.snapshot();
        if !config.is_leader(&config.home) {
            // followers accept, but only to forward
            if !may_forward {
                warn!("dropping forwarded client command: not the leader here either");
                return;
            }
            match config.leader(&config.home) {
                Some(leader) => {
                    self.transport
                        .send(leader, PeerMessage::Forwarded { origin: from, req });
                }
                None => warn!("dropping client command: home group has no live leader"),
            }
            return;
        }
        match req {
            ClientRequest::Begin { nonce } => {
                let tg = TransactionGroup::new(config.home.id, self.next_timestamp());
                let timestamp = self.next_timestamp();
                let txn = self.transaction(tg, &config);
                txn.begin(from, nonce, timestamp, config.data_centers(), self);
            }
            ClientRequest::Read { tg, nonce, seqno, table, key } => {
                self.transaction(tg, &config)
                    .read(from, nonce, seqno, table, key, self);
            }
            ClientRequest::Write { tg, nonce, seqno, table, key, value } => {
                self.transaction(tg, &config)
                    .write(from, nonce, seqno, table, key, value, self);
            }
            ClientRequest::Commit { tg, nonce, seqno } => {
                self.transaction(tg, &config).prepare(from, nonce, seqno, self);
            }
            ClientRequest::Abort { tg, nonce, seqno } => {
                self.transaction(tg, &config).abort(from, nonce, seqno, self);
            }
        }
    }

    fn handle_peer(&self, from: CommId, msg: PeerMessage) {
        let config = self.config.snapshot();
        match msg {
            PeerMessage::Paxos2A { tg, seqno, kind, payload } => {
                self.transaction(tg, &config)
                    .paxos_2a(from, seqno, kind, payload, self);
            }
            PeerMessage::Paxos2B { tg, seqno } => {
                self.transaction(tg, &config).paxos_2b(from, seqno, self);
            }
            PeerMessage::CommitRecord { tg, record } => {
                let record = match CommitRecord::decode(&record) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("{}: dropping undecodable commit record: {}", tg, e);
                        return;
                    }
                };
                if record.tg != tg {
                    warn!("{}: dropping commit record for mismatched group", tg);
                    return;
                }
                let txn = self.transaction(tg, &config);
                txn.observe_dc(record.tg.group, self.next_timestamp());
                txn.commit_record(record, self);
            }
            PeerMessage::LvVote { tg, msg } => {
                let voter = self.local_voter(tg, &config.home);
                if let Some(outcome) = voter.process(from, msg, self) {
                    self.transaction(tg, &config)
                        .local_vote_decided(outcome, self);
                }
            }
            PeerMessage::GvPropose { tg, dc, outcome } => {
                let txn = self.transaction(tg, &config);
                txn.observe_dc(dc, self.next_timestamp());
                let voter = self.global_voter(tg);
                if let Some(decided) = voter.record_outcome(dc, outcome, self) {
                    txn.global_vote_decided(decided, self);
                }
            }
            PeerMessage::GvVote { tg, msg } => {
                let dc = match config.groups.iter().find(|g| g.contains(from)) {
                    Some(group) => group.id,
                    None => {
                        warn!("{}: dropping global vote from unknown replica {}", tg, from);
                        return;
                    }
                };
                let txn = self.transaction(tg, &config);
                txn.observe_dc(dc, self.next_timestamp());
                let voter = self.global_voter(tg);
                if let Some(decided) = voter.process(dc, msg, self) {
                    txn.global_vote_decided(decided, self);
                }
            }
            PeerMessage::Forwarded { origin, req } => {
                self.handle_client(origin, req, false);
            }
        }
    }

    fn handle_kvs(&self, c: KvsCompletion) {
        match self.transactions.get(&c.tg) {
            Some(entry) => entry.value().clone().kvs_callback(c, self),
            None => warn!(
                "{}: discarding {:?} completion for unknown transaction",
                c.tg, c.kind
            ),
        }
    }

    /// The background tick: re-enter every live state machine, push the
    /// vote retransmissions, and retire collected transactions.
    fn tick(&self) {
        let mut collected = Vec::new();
        for entry in self.transactions.iter() {
            let txn = entry.value().clone();
            txn.externally_work_state_machine(self);
            if txn.finished() {
                collected.push(*entry.key());
            }
        }
        for entry in self.local_voters.iter() {
            entry.value().tick(self);
        }
        for entry in self.global_voters.iter() {
            entry.value().tick(self);
        }
        for tg in collected {
            debug!("{}: collected", tg);
            self.transactions.remove(&tg);
            self.local_voters.remove(&tg);
            self.global_voters.remove(&tg);
        }
    }

    // ------------------------------------------------------------------
    // shared state accessors
    // ------------------------------------------------------------------

    /// Pins (creating on first touch) the state machine for `tg`. The
    /// returned handle keeps the object alive for the duration of the
    /// handler even if a concurrent tick retires the map entry.
    fn transaction(&self, tg: TransactionGroup, config: &Config) -> Arc<Transaction> {
        self.transactions
            .get_or_insert_with(tg, || Arc::new(Transaction::new(tg, config)))
            .value()
            .clone()
    }

    /// The state machine for `tg`, if one is live on this replica.
    pub fn transaction_handle(&self, tg: TransactionGroup) -> Option<Arc<Transaction>> {
        self.transactions.get(&tg).map(|e| e.value().clone())
    }

    /// Injects an abort into a live transaction's log, outside the
    /// client command stream.
    pub fn abort_transaction(&self, tg: TransactionGroup) {
        if let Some(txn) = self.transaction_handle(tg) {
            txn.abort_externally(self);
        }
    }

    pub(crate) fn local_voter(&self, tg: TransactionGroup, group: &PaxosGroup) -> Arc<LocalVoter> {
        let us = self.config.snapshot().us;
        self.local_voters
            .get_or_insert_with(tg, || {
                Arc::new(LocalVoter::new(tg, us, group.members.clone()))
            })
            .value()
            .clone()
    }

    pub(crate) fn global_voter(&self, tg: TransactionGroup) -> Arc<GlobalVoter> {
        let home = self.config.snapshot().home.id;
        self.global_voters
            .get_or_insert_with(tg, || Arc::new(GlobalVoter::new(tg, home)))
            .value()
            .clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    /// Atomically installs a new cluster view.
    pub fn reconfigure(&self, config: Config) {
        self.config.swap(config);
    }

    /// Monotone clock for transaction ids and commit-ordering
    /// timestamps: wall time, never repeating, never going backward.
    pub fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let prev = match self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.max(now) + 1)
            }) {
            Ok(prev) | Err(prev) => prev,
        };
        prev.max(now) + 1
    }

    // ------------------------------------------------------------------
    // outbound capabilities handed to the state machines
    // ------------------------------------------------------------------

    pub(crate) fn send(&self, to: CommId, msg: PeerMessage) {
        self.transport.send(to, msg);
    }

    /// Routes a message to a data center: its home group's leader.
    pub(crate) fn send_dc(&self, dc: PaxosGroupId, msg: PeerMessage) {
        let config = self.config.snapshot();
        match config.group(dc).and_then(|group| config.leader(group)) {
            Some(leader) => self.transport.send(leader, msg),
            None => warn!("no live leader for {}; message dropped until retry", dc),
        }
    }

    /// Lets the rest of the home group in on a learned global decision;
    /// the cross-DC vote itself only travels between group leaders.
    pub(crate) fn propagate_global_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) {
        let config = self.config.snapshot();
        for member in &config.home.members {
            if *member != config.us {
                self.send(
                    *member,
                    PeerMessage::GvVote { tg, msg: VoteMsg::Learn { v: outcome } },
                );
            }
        }
    }

    pub(crate) fn reply(&self, to: CommId, response: Bytes) {
        self.transport.reply(to, response);
    }

    pub(crate) fn reply_response(&self, to: CommId, response: &ClientResponse) {
        match response.encode() {
            Ok(encoded) => self.transport.reply(to, encoded),
            Err(e) => warn!("cannot encode reply: {}", e),
        }
    }

    pub(crate) fn kvs_submit(&self, req: KvsRequest) {
        self.kvs.submit(req, &self.kvs_tx);
    }

    pub(crate) fn persist_entry(&self, tg: TransactionGroup, seqno: u64, entry: &Bytes) {
        if let Err(e) = self.log.put_entry(tg, seqno, entry) {
            error!("{}: cannot persist entry {}: {}", tg, seqno, e);
        }
    }

    pub(crate) fn persist_decision(&self, tg: TransactionGroup, outcome: VoteOutcome) {
        if let Err(e) = self.log.put_decision(tg, outcome) {
            error!("{}: cannot persist decision: {}", tg, e);
        }
    }
}
