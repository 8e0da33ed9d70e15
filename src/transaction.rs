use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::kvs::{KvsCompletion, KvsOp, KvsOpKind, KvsRequest};
use crate::log_entry::{CommitRecord, LogEntry, LogEntryKind, RecordedRead, RecordedWrite};
use crate::messages::{ClientResponse, PeerMessage, ReturnCode};
use crate::paxos::{Acceptance, Synod};
use crate::txman::TxMan;
use crate::types::{CommId, PaxosGroup, PaxosGroupId, TransactionGroup, VoteOutcome};

/// Lifecycle of a transaction on one replica. Monotone: a transaction
/// only ever moves forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxState {
    Initialized,
    Executing,
    LocalCommitVote,
    GlobalCommitVote,
    Committed,
    Aborted,
    Terminated,
    Collected,
}

/// Progress of one slot's key-value store work. Phases only advance;
/// which phases apply depends on the entry kind and on whether this
/// replica initiated the transaction or synthesized it from a commit
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum KvsPhase {
    Unstarted,
    LockPending,
    Locked,
    ReadPending,
    ValueReady,
    VerifyReadPending,
    ReadVerified,
    WritePending,
    Written,
    VerifyWritePending,
    WriteVerified,
    UnlockPending,
    Released,
}

/// One slot of the transaction's log, together with everything needed to
/// execute it and answer the client that proposed it.
struct Operation {
    synod: Synod,
    logged: bool,
    kvs: KvsPhase,
    locked: bool,
    failed: Option<ReturnCode>,
    read_timestamp: u64,
    read_value: Option<Bytes>,
    verify_ok: Option<bool>,
    origin: Option<(CommId, u64)>,
    reply: Option<Bytes>,
    replied: bool,
}

impl Operation {
    fn empty(us: CommId, members: Vec<CommId>) -> Self {
        Self {
            synod: Synod::new(us, members),
            logged: false,
            kvs: KvsPhase::Unstarted,
            locked: false,
            failed: None,
            read_timestamp: 0,
            read_value: None,
            verify_ok: None,
            origin: None,
            reply: None,
            replied: false,
        }
    }

    fn entry(&self) -> Option<&LogEntry> {
        self.synod.entry()
    }

    fn durable(&self) -> bool {
        self.synod.is_durable()
    }
}

struct DataCenter {
    id: PaxosGroupId,
    /// Timestamp of the last send to or hearing from this data center;
    /// used to pace inter-DC retransmissions.
    timestamp: u64,
}

struct Inner {
    us: CommId,
    state: TxState,
    /// The home group this replica coordinates in. For a transaction
    /// synthesized from a remote commit record this is still the local
    /// group; the originating group travels inside the begin entry.
    group: PaxosGroup,
    remote: bool,
    timestamp: u64,
    dcs: Vec<DataCenter>,
    prefer_to_commit: bool,
    ops: Vec<Operation>,
    deferred_2b: Vec<(CommId, u64)>,
    local_outcome: Option<VoteOutcome>,
    lv_proposed: bool,
    gv_recorded: bool,
    global_outcome: Option<VoteOutcome>,
    decision_logged: bool,
    record: Option<Bytes>,
    record_forwarded: bool,
    quiesce: u32,
}

/// The per-transaction coordinator state machine.
///
/// One instance exists on every replica of the transaction's home group
/// (and on every replica of each participating data center once the
/// commit record arrives there). All four input sources (client
/// commands, home-group Paxos traffic, inter-DC messages, and key-value
/// store completions) funnel into the single mutex here, so the state
/// machine is a deterministic serial actor. Handlers never block on
/// anything but that mutex; asynchrony is a later event.
pub struct Transaction {
    tg: TransactionGroup,
    mtx: Mutex<Inner>,
}

impl Transaction {
    /// Creates the state machine for `tg` on this replica.
    ///
    /// This is typically called internally by the [`TxMan`] daemon when
    /// the first event for a transaction group arrives, whatever that
    /// event is: a client begin, a peer's 2A, or an inbound commit
    /// record. The object starts in `Initialized` and owns no log slots
    /// until an event proposes one.
    ///
    /// # Arguments
    ///
    /// * `tg` - The transaction group anchoring this transaction's home
    ///   Paxos log.
    /// * `config` - The current cluster view; fixes this replica's
    ///   identity and home group for the life of the object.
    ///
    /// # Returns
    ///
    /// A new `Transaction` in the `Initialized` state.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use txman::{CommId, Config, PaxosGroup, PaxosGroupId, Transaction, TransactionGroup};
    ///
    /// let home = PaxosGroup::new(PaxosGroupId(1), vec![CommId(1)]);
    /// let config = Config {
    ///     us: CommId(1),
    ///     home: home.clone(),
    ///     groups: vec![home],
    ///     offline: Vec::new(),
    ///     collect_after_ticks: 4,
    /// };
    /// let tg = TransactionGroup::new(config.home.id, 42);
    /// let txn = Transaction::new(tg, &config);
    /// assert_eq!(txn.state_key(), &tg);
    /// ```
    pub fn new(tg: TransactionGroup, config: &Config) -> Self {
        Self {
            tg,
            mtx: Mutex::new(Inner {
                us: config.us,
                state: TxState::Initialized,
                group: config.home.clone(),
                remote: tg.group != config.home.id,
                timestamp: 0,
                dcs: Vec::new(),
                prefer_to_commit: true,
                ops: Vec::new(),
                deferred_2b: Vec::new(),
                local_outcome: None,
                lv_proposed: false,
                gv_recorded: false,
                global_outcome: None,
                decision_logged: false,
                record: None,
                record_forwarded: false,
                quiesce: 0,
            }),
        }
    }

    /// Rebuilds a transaction from the entries a crashed replica left in
    /// its durable log. Entries come back as accepted-but-unacknowledged;
    /// the background tick rebroadcasts them and the home group
    /// re-establishes durability. A persisted decision short-circuits
    /// the votes.
    pub(crate) fn recover(
        tg: TransactionGroup,
        config: &Config,
        entries: Vec<(u64, Vec<u8>)>,
        decision: Option<VoteOutcome>,
    ) -> Self {
        let txn = Self::new(tg, config);
        {
            let mut inner = txn.mtx.lock();
            inner.state = TxState::Executing;
            for (seqno, bytes) in entries {
                let entry = match LogEntry::decode_any(&bytes) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("{}: dropping unreadable recovered entry {}: {}", tg, seqno, e);
                        continue;
                    }
                };
                let idx = seqno as usize;
                resize_to_hold(&mut inner, idx);
                inner.ops[idx].synod.propose(entry, Bytes::from(bytes));
                inner.ops[idx].logged = true;
            }
            if let Some(outcome) = decision {
                inner.global_outcome = Some(outcome);
                inner.decision_logged = true;
            }
        }
        txn
    }

    pub fn state_key(&self) -> &TransactionGroup {
        &self.tg
    }

    pub fn state(&self) -> TxState {
        self.mtx.lock().state
    }

    /// True once the quiescence delay has passed and the daemon may drop
    /// this object from its map.
    pub fn finished(&self) -> bool {
        self.mtx.lock().state == TxState::Collected
    }

    /// The decided entry at `seqno`, once a home-group majority has
    /// accepted it.
    pub fn durable_entry(&self, seqno: u64) -> Option<LogEntry> {
        let inner = self.mtx.lock();
        let idx = seqno as usize;
        if idx < inner.ops.len() && inner.ops[idx].durable() {
            inner.ops[idx].entry().cloned()
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // client command ingress
    // ------------------------------------------------------------------

    pub fn begin(
        &self,
        client: CommId,
        nonce: u64,
        timestamp: u64,
        dcs: Vec<PaxosGroupId>,
        d: &TxMan,
    ) {
        let mut inner = self.mtx.lock();
        self.ensure_initialized(&mut inner);
        let entry = LogEntry::Begin {
            timestamp,
            group: inner.group.clone(),
            dcs,
        };
        self.internal_log(&mut inner, "client", 0, entry, Some((client, nonce)), d);
    }

    pub fn read(
        &self,
        client: CommId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        d: &TxMan,
    ) {
        let mut inner = self.mtx.lock();
        if seqno == 0 {
            d.reply_response(
                client,
                &ClientResponse::Read { nonce, status: ReturnCode::Garbage, value: None },
            );
            return;
        }
        self.ensure_initialized(&mut inner);
        let entry = LogEntry::Read { table, key };
        self.internal_log(&mut inner, "client", seqno, entry, Some((client, nonce)), d);
    }

    pub fn write(
        &self,
        client: CommId,
        nonce: u64,
        seqno: u64,
        table: Bytes,
        key: Bytes,
        value: Bytes,
        d: &TxMan,
    ) {
        let mut inner = self.mtx.lock();
        if seqno == 0 {
            d.reply_response(
                client,
                &ClientResponse::Write { nonce, status: ReturnCode::Garbage },
            );
            return;
        }
        self.ensure_initialized(&mut inner);
        let entry = LogEntry::Write { table, key, value };
        self.internal_log(&mut inner, "client", seqno, entry, Some((client, nonce)), d);
    }

    pub fn prepare(&self, client: CommId, nonce: u64, seqno: u64, d: &TxMan) {
        let mut inner = self.mtx.lock();
        if seqno == 0 {
            d.reply_response(
                client,
                &ClientResponse::Commit { nonce, status: ReturnCode::Garbage },
            );
            return;
        }
        self.ensure_initialized(&mut inner);
        self.internal_log(&mut inner, "client", seqno, LogEntry::Prepare, Some((client, nonce)), d);
    }

    pub fn abort(&self, client: CommId, nonce: u64, seqno: u64, d: &TxMan) {
        let mut inner = self.mtx.lock();
        if seqno == 0 {
            d.reply_response(
                client,
                &ClientResponse::Abort { nonce, status: ReturnCode::Garbage },
            );
            return;
        }
        self.ensure_initialized(&mut inner);
        self.internal_log(&mut inner, "client", seqno, LogEntry::Abort, Some((client, nonce)), d);
    }

    /// Aborts a transaction from outside the client command stream by
    /// appending an abort entry at the next free slot.
    pub fn abort_externally(&self, d: &TxMan) {
        let mut inner = self.mtx.lock();
        if inner.state > TxState::Executing {
            return;
        }
        self.ensure_initialized(&mut inner);
        let seqno = inner.ops.len().max(1) as u64;
        self.internal_log(&mut inner, "external", seqno, LogEntry::Abort, None, d);
    }

    // ------------------------------------------------------------------
    // home-group replication
    // ------------------------------------------------------------------

    pub fn paxos_2a(
        &self,
        from: CommId,
        seqno: u64,
        kind: LogEntryKind,
        payload: Bytes,
        d: &TxMan,
    ) {
        let entry = match LogEntry::decode(kind, &payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{}: dropping 2a from {} at {}: {}", self.tg, from, seqno, e);
                return;
            }
        };
        if (kind == LogEntryKind::Begin) != (seqno == 0) {
            warn!("{}: dropping 2a from {}: {:?} at seqno {}", self.tg, from, kind, seqno);
            return;
        }
        let mut inner = self.mtx.lock();
        self.ensure_initialized(&mut inner);
        let idx = seqno as usize;
        resize_to_hold(&mut inner, idx);
        if self.violates_terminal(&inner, idx, &entry) {
            warn!("{}: dropping 2a past the terminal entry at seqno {}", self.tg, seqno);
            return;
        }
        match inner.ops[idx].synod.propose(entry, payload) {
            Acceptance::Accepted | Acceptance::Duplicate => {
                // the 2a itself is the sender's acceptance
                inner.ops[idx].synod.ack(from);
                self.persist(&mut inner, idx, d);
                self.send_paxos_2b(&inner, idx, d);
                self.drain_deferred_2b(&mut inner, idx);
            }
            Acceptance::Superseded => {
                // we hold the deterministically stronger proposal; push
                // it back at the sender so the group converges
                self.send_paxos_2a_to(&inner, idx, from, d);
                self.drain_deferred_2b(&mut inner, idx);
            }
            Acceptance::Finalized => {
                warn!("{}: conflicting 2a for durable slot {} from {}", self.tg, seqno, from);
                self.send_paxos_2a_to(&inner, idx, from, d);
            }
        }
        self.work_state_machine(&mut inner, false, d);
    }

    pub fn paxos_2b(&self, from: CommId, seqno: u64, d: &TxMan) {
        let mut inner = self.mtx.lock();
        let idx = seqno as usize;
        if idx >= inner.ops.len() || inner.ops[idx].entry().is_none() {
            // ack arrived ahead of its proposal
            if !inner.deferred_2b.contains(&(from, seqno)) {
                inner.deferred_2b.push((from, seqno));
            }
            return;
        }
        if inner.ops[idx].synod.ack(from) {
            debug!("{}: slot {} durable", self.tg, seqno);
        }
        self.work_state_machine(&mut inner, false, d);
    }

    // ------------------------------------------------------------------
    // inter-data-center ingress
    // ------------------------------------------------------------------

    /// Installs the log shipped by the initiating data center and starts
    /// this data center's side of the commit: verify the reads, vote
    /// locally, contribute to the global vote.
    pub fn commit_record(&self, record: CommitRecord, d: &TxMan) {
        let mut inner = self.mtx.lock();
        self.ensure_initialized(&mut inner);
        let first_sight = !inner.record_forwarded;

        self.seed_slot(
            &mut inner,
            0,
            LogEntry::Begin {
                timestamp: record.timestamp,
                group: record.group.clone(),
                dcs: record.dcs.clone(),
            },
        );
        for r in &record.reads {
            self.seed_slot(
                &mut inner,
                r.seqno,
                LogEntry::Read { table: r.table.clone(), key: r.key.clone() },
            );
            let op = &mut inner.ops[r.seqno as usize];
            op.read_timestamp = r.timestamp;
            op.read_value = r.value.clone();
            if op.kvs < KvsPhase::ValueReady {
                op.kvs = KvsPhase::ValueReady;
            }
        }
        for w in &record.writes {
            self.seed_slot(
                &mut inner,
                w.seqno,
                LogEntry::Write {
                    table: w.table.clone(),
                    key: w.key.clone(),
                    value: w.value.clone(),
                },
            );
        }
        let terminal = if record.terminal == LogEntryKind::Prepare {
            LogEntry::Prepare
        } else {
            LogEntry::Abort
        };
        self.seed_slot(&mut inner, record.terminal_seqno, terminal);
        for idx in 0..inner.ops.len() {
            self.persist(&mut inner, idx, d);
        }

        // remember who participates and what the origin voted
        self.absorb_begin(&mut inner);
        let gv = d.global_voter(self.tg);
        gv.set_dcs(&record.dcs);
        if let Some(newly) = gv.record_outcome(record.tg.group, record.origin_vote, d) {
            inner.global_outcome.get_or_insert(newly);
        }

        if first_sight {
            inner.record_forwarded = true;
            if let Ok(encoded) = record.encode() {
                let msg = PeerMessage::CommitRecord { tg: self.tg, record: encoded };
                for member in inner.group.members.clone() {
                    if member != inner.us {
                        d.send(member, msg.clone());
                    }
                }
            }
        }
        self.work_state_machine(&mut inner, false, d);
    }

    /// Installs one commit-record entry as durable. The record is
    /// already durable at its origin, so it overrides any non-durable
    /// local proposal; contradicting an already durable slot is
    /// corruption and is logged and ignored.
    fn seed_slot(&self, inner: &mut Inner, seqno: u64, entry: LogEntry) {
        let idx = seqno as usize;
        resize_to_hold(inner, idx);
        let encoded = match entry.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("{}: cannot encode record entry at {}: {}", self.tg, seqno, e);
                return;
            }
        };
        if inner.ops[idx].durable() {
            if inner.ops[idx].synod.encoded() != Some(&encoded) {
                warn!("{}: commit record contradicts durable slot {}", self.tg, seqno);
            }
            return;
        }
        let us = inner.us;
        let members = inner.group.members.clone();
        inner.ops[idx].synod = Synod::seed_durable(us, members, entry, encoded);
        inner.ops[idx].logged = false;
    }

    /// Records the timestamp of the last message heard from a data
    /// center; retransmissions skip recently heard participants.
    pub fn observe_dc(&self, dc: PaxosGroupId, timestamp: u64) {
        let mut inner = self.mtx.lock();
        if let Some(info) = inner.dcs.iter_mut().find(|info| info.id == dc) {
            if info.timestamp < timestamp {
                info.timestamp = timestamp;
            }
        }
    }

    // ------------------------------------------------------------------
    // vote plumbing
    // ------------------------------------------------------------------

    pub fn local_vote_decided(&self, outcome: VoteOutcome, d: &TxMan) {
        let mut inner = self.mtx.lock();
        if inner.local_outcome.is_none() {
            debug!("{}: local vote decided {}", self.tg, outcome);
            inner.local_outcome = Some(outcome);
        }
        self.work_state_machine(&mut inner, false, d);
    }

    pub fn global_vote_decided(&self, outcome: VoteOutcome, d: &TxMan) {
        let mut inner = self.mtx.lock();
        if inner.global_outcome.is_none() {
            debug!("{}: global vote decided {}", self.tg, outcome);
            inner.global_outcome = Some(outcome);
            d.propagate_global_decision(self.tg, outcome);
        }
        self.work_state_machine(&mut inner, false, d);
    }

    // ------------------------------------------------------------------
    // key-value store completions
    // ------------------------------------------------------------------

    pub fn kvs_callback(&self, c: KvsCompletion, d: &TxMan) {
        let mut inner = self.mtx.lock();
        let idx = c.seqno as usize;
        if idx >= inner.ops.len() || inner.ops[idx].entry().is_none() {
            warn!(
                "{}: discarding {:?} completion for unknown seqno {}",
                self.tg, c.kind, c.seqno
            );
            return;
        }
        match c.kind {
            KvsOpKind::Lock => {
                if inner.ops[idx].kvs == KvsPhase::LockPending {
                    if c.rc.is_success() {
                        inner.ops[idx].kvs = KvsPhase::Locked;
                        inner.ops[idx].locked = true;
                    } else {
                        inner.ops[idx].failed = Some(c.rc);
                        self.avoid_commit_if_possible(&mut inner);
                    }
                }
            }
            KvsOpKind::Unlock => {
                if inner.ops[idx].kvs == KvsPhase::UnlockPending {
                    if !c.rc.is_success() {
                        warn!("{}: unlock of seqno {} returned {:?}", self.tg, c.seqno, c.rc);
                    }
                    inner.ops[idx].kvs = KvsPhase::Released;
                }
            }
            KvsOpKind::Read => {
                if inner.ops[idx].kvs == KvsPhase::ReadPending {
                    match c.rc {
                        ReturnCode::Success => {
                            inner.ops[idx].read_timestamp = c.timestamp;
                            inner.ops[idx].read_value = c.value;
                            inner.ops[idx].kvs = KvsPhase::ValueReady;
                        }
                        ReturnCode::NotFound => {
                            inner.ops[idx].read_timestamp = c.timestamp;
                            inner.ops[idx].read_value = None;
                            inner.ops[idx].kvs = KvsPhase::ValueReady;
                        }
                        rc => {
                            inner.ops[idx].failed = Some(rc);
                            self.avoid_commit_if_possible(&mut inner);
                        }
                    }
                }
            }
            KvsOpKind::VerifyRead => {
                if inner.ops[idx].kvs == KvsPhase::VerifyReadPending {
                    let ok = match c.rc {
                        ReturnCode::Success => {
                            c.timestamp == inner.ops[idx].read_timestamp
                                && c.value == inner.ops[idx].read_value
                        }
                        ReturnCode::NotFound => inner.ops[idx].read_value.is_none(),
                        _ => false,
                    };
                    inner.ops[idx].verify_ok = Some(ok);
                    inner.ops[idx].kvs = KvsPhase::ReadVerified;
                    if !ok {
                        debug!("{}: verify-read mismatch at seqno {}", self.tg, c.seqno);
                        self.avoid_commit_if_possible(&mut inner);
                    }
                }
            }
            KvsOpKind::Write => {
                if inner.ops[idx].kvs == KvsPhase::WritePending {
                    if c.rc.is_success() {
                        inner.ops[idx].kvs = KvsPhase::Written;
                    } else {
                        // retried from the next tick
                        warn!("{}: write of seqno {} returned {:?}", self.tg, c.seqno, c.rc);
                    }
                }
            }
            KvsOpKind::VerifyWrite => {
                if inner.ops[idx].kvs == KvsPhase::VerifyWritePending {
                    if c.rc.is_success() {
                        inner.ops[idx].kvs = KvsPhase::WriteVerified;
                    } else {
                        warn!(
                            "{}: verify-write of seqno {} returned {:?}",
                            self.tg, c.seqno, c.rc
                        );
                    }
                }
            }
        }
        self.work_state_machine(&mut inner, false, d);
    }

    // ------------------------------------------------------------------
    // background tick
    // ------------------------------------------------------------------

    /// Re-enters the state machine when no external event will: ages the
    /// quiescence counter and retransmits whatever is outstanding.
    pub fn externally_work_state_machine(&self, d: &TxMan) {
        let mut inner = self.mtx.lock();
        let idle_shell = inner.state == TxState::Initialized && inner.ops.is_empty();
        if inner.state == TxState::Terminated || idle_shell {
            // terminated transactions linger to answer duplicates; bare
            // shells left by stray late messages age out the same way
            inner.quiesce += 1;
            if inner.quiesce >= d.config().collect_after_ticks {
                inner.state = TxState::Collected;
            }
            return;
        }
        // rebroadcast accepted-but-not-durable slots
        for idx in 0..inner.ops.len() {
            if inner.ops[idx].entry().is_some() && !inner.ops[idx].durable() {
                self.send_paxos_2a(&inner, idx, d);
            }
        }
        self.work_state_machine(&mut inner, true, d);
    }

    // ------------------------------------------------------------------
    // the state machine proper
    // ------------------------------------------------------------------

    fn work_state_machine(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        loop {
            let before = inner.state;
            match inner.state {
                TxState::Initialized => break,
                TxState::Executing => self.work_executing(inner, resend, d),
                TxState::LocalCommitVote => self.work_local_commit_vote(inner, resend, d),
                TxState::GlobalCommitVote => self.work_global_commit_vote(inner, resend, d),
                TxState::Committed => self.work_committed(inner, resend, d),
                TxState::Aborted => self.work_aborted(inner, resend, d),
                TxState::Terminated | TxState::Collected => break,
            }
            if inner.state == before {
                break;
            }
            debug!("{}: {:?} -> {:?}", self.tg, before, inner.state);
        }
    }

    /// Walks the durable prefix of the log in order, advancing each
    /// operation's key-value work, and leaves `Executing` when a durable
    /// terminal entry is reached. Never advances past a non-durable slot.
    fn work_executing(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        self.absorb_begin(inner);
        for idx in 0..inner.ops.len() {
            if !inner.ops[idx].durable() {
                break;
            }
            let kind = match inner.ops[idx].entry() {
                Some(entry) => entry.kind(),
                None => break,
            };
            match kind {
                LogEntryKind::Read | LogEntryKind::Write => {
                    self.advance_executing_kvs(inner, idx, resend, d);
                    self.maybe_reply(inner, idx, d);
                }
                LogEntryKind::Begin => {
                    self.maybe_reply(inner, idx, d);
                }
                LogEntryKind::Prepare => {
                    inner.state = TxState::LocalCommitVote;
                    return;
                }
                LogEntryKind::Abort => {
                    inner.state = TxState::Aborted;
                    return;
                }
            }
        }
    }

    /// Drives the verify-reads, then puts this data center's vote to the
    /// home group. The vote commits only if the terminal entry is a
    /// prepare, nothing failed locally, and every read still verifies at
    /// the transaction's timestamp.
    fn work_local_commit_vote(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        if inner.global_outcome.is_some() {
            // a recovered decision outranks re-deriving the vote
            inner.state = TxState::GlobalCommitVote;
            return;
        }
        let mut ready = true;
        let mut all_verified = true;
        let mut any_failed = false;
        let mut terminal = None;
        for idx in 0..inner.ops.len() {
            if !inner.ops[idx].durable() {
                break;
            }
            let kind = match inner.ops[idx].entry() {
                Some(entry) => entry.kind(),
                None => break,
            };
            match kind {
                LogEntryKind::Read => {
                    if inner.ops[idx].failed.is_some() {
                        any_failed = true;
                        self.maybe_reply(inner, idx, d);
                        continue;
                    }
                    match inner.ops[idx].kvs {
                        // the prepare can land while earlier reads are
                        // still in flight; keep driving them here
                        KvsPhase::Unstarted
                        | KvsPhase::LockPending
                        | KvsPhase::Locked
                        | KvsPhase::ReadPending => {
                            self.advance_executing_kvs(inner, idx, resend, d)
                        }
                        KvsPhase::ValueReady => self.start_verify_read(inner, idx, d),
                        KvsPhase::VerifyReadPending if resend => {
                            self.start_verify_read(inner, idx, d)
                        }
                        _ => {}
                    }
                    self.maybe_reply(inner, idx, d);
                    match inner.ops[idx].verify_ok {
                        Some(true) => {}
                        Some(false) => all_verified = false,
                        None => ready = false,
                    }
                }
                LogEntryKind::Write => {
                    if inner.ops[idx].failed.is_some() {
                        any_failed = true;
                    } else if !inner.remote && inner.ops[idx].kvs < KvsPhase::Locked {
                        self.advance_executing_kvs(inner, idx, resend, d);
                        if inner.ops[idx].kvs < KvsPhase::Locked {
                            ready = false;
                        }
                    }
                    self.maybe_reply(inner, idx, d);
                }
                LogEntryKind::Prepare | LogEntryKind::Abort => terminal = Some(kind),
                LogEntryKind::Begin => {}
            }
        }
        if !ready {
            return;
        }
        let vote = if terminal == Some(LogEntryKind::Prepare)
            && all_verified
            && !any_failed
            && inner.prefer_to_commit
        {
            VoteOutcome::Commit
        } else {
            VoteOutcome::Abort
        };
        let config = d.config();
        let voter = d.local_voter(self.tg, &inner.group);
        if config.is_leader(&inner.group) && !inner.lv_proposed {
            inner.lv_proposed = true;
            voter.propose(vote, d);
        }
        if inner.local_outcome.is_none() {
            if let Some(outcome) = voter.outcome() {
                inner.local_outcome = Some(outcome);
            }
        }
        if inner.local_outcome.is_some() {
            inner.state = TxState::GlobalCommitVote;
        }
    }

    /// Ships the commit record to the other data centers, feeds the
    /// local outcome into the global vote, and applies the unanimity
    /// decision once it is learned and durable.
    fn work_global_commit_vote(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        let gv = d.global_voter(self.tg);
        let dc_ids: Vec<PaxosGroupId> = inner.dcs.iter().map(|info| info.id).collect();
        gv.set_dcs(&dc_ids);
        if let Some(local) = inner.local_outcome {
            if !inner.gv_recorded {
                inner.gv_recorded = true;
                gv.record_local(local, d);
            }
        }
        let config = d.config();
        if !inner.remote && config.is_leader(&inner.group) {
            self.send_commit_record(inner, &gv.heard_from(), resend, d);
        }
        if inner.global_outcome.is_none() {
            if let Some(outcome) = gv.outcome() {
                inner.global_outcome = Some(outcome);
                d.propagate_global_decision(self.tg, outcome);
            }
        }
        if let Some(outcome) = inner.global_outcome {
            if !inner.decision_logged {
                d.persist_decision(self.tg, outcome);
                inner.decision_logged = true;
            }
            inner.state = if outcome.is_commit() {
                TxState::Committed
            } else {
                TxState::Aborted
            };
        }
    }

    /// Applies every durable write at the transaction's timestamp,
    /// verifies it landed, releases the locks this replica took, and
    /// answers the client.
    fn work_committed(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        let mut outstanding = false;
        for idx in 0..inner.ops.len() {
            let kind = match inner.ops[idx].entry() {
                Some(entry) if inner.ops[idx].durable() => entry.kind(),
                _ => continue,
            };
            match kind {
                LogEntryKind::Write => {
                    match inner.ops[idx].kvs {
                        KvsPhase::Unstarted if inner.remote => self.start_write(inner, idx, d),
                        KvsPhase::Locked => self.start_write(inner, idx, d),
                        KvsPhase::WritePending if resend => self.start_write(inner, idx, d),
                        KvsPhase::Written => self.start_verify_write(inner, idx, d),
                        KvsPhase::VerifyWritePending if resend => {
                            self.start_verify_write(inner, idx, d)
                        }
                        KvsPhase::WriteVerified => {
                            if inner.ops[idx].locked {
                                self.release_lock(inner, idx, d);
                            } else {
                                inner.ops[idx].kvs = KvsPhase::Released;
                            }
                        }
                        KvsPhase::UnlockPending if resend => self.release_lock(inner, idx, d),
                        _ => {}
                    }
                    if !write_done(&inner.ops[idx]) {
                        outstanding = true;
                    }
                }
                LogEntryKind::Read => {
                    if inner.ops[idx].locked && inner.ops[idx].kvs < KvsPhase::UnlockPending {
                        self.release_lock(inner, idx, d);
                    } else if inner.ops[idx].kvs == KvsPhase::UnlockPending && resend {
                        self.release_lock(inner, idx, d);
                    }
                    if inner.ops[idx].locked && inner.ops[idx].kvs != KvsPhase::Released {
                        outstanding = true;
                    }
                }
                _ => {}
            }
        }
        if outstanding {
            return;
        }
        self.reply_terminal(inner, d);
        inner.state = TxState::Terminated;
    }

    /// Releases whatever locks were actually acquired and answers the
    /// client with the abort. Nothing else has touched the store, since
    /// writes are withheld until commit.
    fn work_aborted(&self, inner: &mut Inner, resend: bool, d: &TxMan) {
        if !inner.decision_logged {
            d.persist_decision(self.tg, VoteOutcome::Abort);
            inner.decision_logged = true;
        }
        inner.global_outcome.get_or_insert(VoteOutcome::Abort);
        let mut outstanding = false;
        for idx in 0..inner.ops.len() {
            if inner.ops[idx].entry().is_none() {
                continue;
            }
            if inner.ops[idx].locked && inner.ops[idx].kvs < KvsPhase::UnlockPending {
                self.release_lock(inner, idx, d);
            } else if inner.ops[idx].kvs == KvsPhase::UnlockPending && resend {
                self.release_lock(inner, idx, d);
            }
            if inner.ops[idx].locked && inner.ops[idx].kvs != KvsPhase::Released {
                outstanding = true;
            }
        }
        if outstanding {
            return;
        }
        self.reply_terminal(inner, d);
        inner.state = TxState::Terminated;
    }

    // ------------------------------------------------------------------
    // ingress internals
    // ------------------------------------------------------------------

    fn ensure_initialized(&self, inner: &mut Inner) {
        if inner.state == TxState::Initialized {
            inner.state = TxState::Executing;
        }
    }

    /// Common ingress path: place `entry` at `seqno` if the slot is free
    /// or holds the identical proposal, replicate it, and remember who
    /// to answer. A conflicting retry on a finalized slot is answered
    /// with the finalized result instead of re-proposing.
    fn internal_log(
        &self,
        inner: &mut Inner,
        source: &str,
        seqno: u64,
        entry: LogEntry,
        origin: Option<(CommId, u64)>,
        d: &TxMan,
    ) {
        let idx = seqno as usize;
        resize_to_hold(inner, idx);
        if self.violates_terminal(inner, idx, &entry) {
            if let Some((client, nonce)) = origin {
                d.reply_response(client, &refusal(&entry, nonce, ReturnCode::Aborted));
            }
            return;
        }
        let encoded = match entry.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("{}: cannot encode {} entry at {}: {}", self.tg, source, seqno, e);
                return;
            }
        };
        let identical = inner.ops[idx].synod.encoded() == Some(&encoded);
        match inner.ops[idx].synod.propose(entry, encoded) {
            Acceptance::Accepted | Acceptance::Duplicate => {
                self.remember_origin(inner, idx, origin, d);
                self.persist(inner, idx, d);
                self.send_paxos_2a(inner, idx, d);
                self.drain_deferred_2b(inner, idx);
            }
            Acceptance::Superseded => {
                // the slot already holds a stronger proposal; the caller
                // learns its fate when that proposal finalizes
                self.remember_origin(inner, idx, origin, d);
            }
            Acceptance::Finalized => {
                if identical {
                    self.remember_origin(inner, idx, origin, d);
                } else if let Some((client, nonce)) = origin {
                    debug!(
                        "{}: {} retry conflicts with finalized slot {}",
                        self.tg, source, seqno
                    );
                    let response = self.compute_response(inner, idx, nonce);
                    d.reply_response(client, &response);
                }
            }
        }
        self.work_state_machine(inner, false, d);
    }

    /// Records `(client, nonce)` against the slot. A duplicate of the
    /// original request replays the cached reply bytes; a different
    /// caller landing on the same slot gets the computed result once it
    /// is known.
    fn remember_origin(
        &self,
        inner: &mut Inner,
        idx: usize,
        origin: Option<(CommId, u64)>,
        d: &TxMan,
    ) {
        let (client, nonce) = match origin {
            Some(o) => o,
            None => return,
        };
        match inner.ops[idx].origin {
            None => inner.ops[idx].origin = Some((client, nonce)),
            Some(existing) if existing == (client, nonce) => {
                if let Some(cached) = &inner.ops[idx].reply {
                    d.reply(client, cached.clone());
                }
            }
            Some(_) => {
                // a different request landed on an occupied slot; answer
                // from current knowledge without disturbing the original
                let response = self.compute_response(inner, idx, nonce);
                d.reply_response(client, &response);
            }
        }
    }

    /// True if placing `entry` at `idx` would put an operation past a
    /// durable terminal entry or a second terminal into the log.
    fn violates_terminal(&self, inner: &Inner, idx: usize, entry: &LogEntry) -> bool {
        for (i, op) in inner.ops.iter().enumerate() {
            if i == idx || !op.durable() {
                continue;
            }
            if let Some(existing) = op.entry() {
                if existing.is_terminal() && (idx > i || entry.is_terminal()) {
                    return true;
                }
            }
        }
        false
    }

    fn absorb_begin(&self, inner: &mut Inner) {
        if inner.timestamp != 0 || inner.ops.is_empty() || !inner.ops[0].durable() {
            return;
        }
        if let Some(LogEntry::Begin { timestamp, dcs, .. }) = inner.ops[0].entry() {
            inner.timestamp = *timestamp;
            let dcs = dcs.clone();
            inner.dcs = dcs
                .into_iter()
                .map(|id| DataCenter { id, timestamp: 0 })
                .collect();
        }
    }

    /// Local evidence says committing cannot succeed; remember to vote
    /// abort. Advisory only; the votes still decide.
    fn avoid_commit_if_possible(&self, inner: &mut Inner) {
        inner.prefer_to_commit = false;
    }

    // ------------------------------------------------------------------
    // key-value store drivers
    // ------------------------------------------------------------------

    fn advance_executing_kvs(&self, inner: &mut Inner, idx: usize, resend: bool, d: &TxMan) {
        if inner.remote || inner.ops[idx].failed.is_some() {
            // a synthesized transaction only verifies reads, at vote time
            return;
        }
        let kind = match inner.ops[idx].entry() {
            Some(entry) => entry.kind(),
            None => return,
        };
        match (kind, inner.ops[idx].kvs) {
            (_, KvsPhase::Unstarted) => self.acquire_lock(inner, idx, d),
            (_, KvsPhase::LockPending) if resend => self.acquire_lock(inner, idx, d),
            (LogEntryKind::Read, KvsPhase::Locked) => self.start_read(inner, idx, d),
            (LogEntryKind::Read, KvsPhase::ReadPending) if resend => {
                self.start_read(inner, idx, d)
            }
            _ => {}
        }
    }

    fn table_key(&self, inner: &Inner, idx: usize) -> Option<(Bytes, Bytes)> {
        match inner.ops[idx].entry() {
            Some(LogEntry::Read { table, key }) => Some((table.clone(), key.clone())),
            Some(LogEntry::Write { table, key, .. }) => Some((table.clone(), key.clone())),
            _ => None,
        }
    }

    fn acquire_lock(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some((table, key)) = self.table_key(inner, idx) {
            inner.ops[idx].kvs = KvsPhase::LockPending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::Lock { table, key },
            });
        }
    }

    fn release_lock(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some((table, key)) = self.table_key(inner, idx) {
            inner.ops[idx].kvs = KvsPhase::UnlockPending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::Unlock { table, key },
            });
        }
    }

    fn start_read(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some((table, key)) = self.table_key(inner, idx) {
            let timestamp = inner.timestamp;
            inner.ops[idx].kvs = KvsPhase::ReadPending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::Read { table, key, timestamp },
            });
        }
    }

    fn start_write(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some(LogEntry::Write { table, key, value }) = inner.ops[idx].entry() {
            let (table, key, value) = (table.clone(), key.clone(), value.clone());
            let timestamp = inner.timestamp;
            inner.ops[idx].kvs = KvsPhase::WritePending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::Write { table, key, timestamp, value },
            });
        }
    }

    fn start_verify_read(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some((table, key)) = self.table_key(inner, idx) {
            let timestamp = inner.timestamp;
            inner.ops[idx].kvs = KvsPhase::VerifyReadPending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::VerifyRead { table, key, timestamp },
            });
        }
    }

    fn start_verify_write(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if let Some((table, key)) = self.table_key(inner, idx) {
            let timestamp = inner.timestamp;
            inner.ops[idx].kvs = KvsPhase::VerifyWritePending;
            d.kvs_submit(KvsRequest {
                tg: self.tg,
                seqno: idx as u64,
                op: KvsOp::VerifyWrite { table, key, timestamp },
            });
        }
    }

    // ------------------------------------------------------------------
    // replication sends
    // ------------------------------------------------------------------

    fn send_paxos_2a(&self, inner: &Inner, idx: usize, d: &TxMan) {
        for member in &inner.group.members {
            if *member != inner.us {
                self.send_paxos_2a_to(inner, idx, *member, d);
            }
        }
    }

    fn send_paxos_2a_to(&self, inner: &Inner, idx: usize, to: CommId, d: &TxMan) {
        let (kind, payload) = match (inner.ops[idx].entry(), inner.ops[idx].synod.encoded()) {
            (Some(entry), Some(encoded)) => (entry.kind(), encoded.clone()),
            _ => return,
        };
        d.send(
            to,
            PeerMessage::Paxos2A { tg: self.tg, seqno: idx as u64, kind, payload },
        );
    }

    fn send_paxos_2b(&self, inner: &Inner, idx: usize, d: &TxMan) {
        for member in &inner.group.members {
            if *member != inner.us {
                d.send(*member, PeerMessage::Paxos2B { tg: self.tg, seqno: idx as u64 });
            }
        }
    }

    fn drain_deferred_2b(&self, inner: &mut Inner, idx: usize) {
        let seqno = idx as u64;
        let mut deferred = std::mem::take(&mut inner.deferred_2b);
        deferred.retain(|(from, s)| {
            if *s != seqno {
                return true;
            }
            if inner.ops[idx].synod.ack(*from) {
                debug!("{}: slot {} durable after deferred acks", self.tg, seqno);
            }
            false
        });
        inner.deferred_2b = deferred;
    }

    fn persist(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        if inner.ops[idx].logged {
            return;
        }
        if let Some(encoded) = inner.ops[idx].synod.encoded() {
            d.persist_entry(self.tg, idx as u64, encoded);
            inner.ops[idx].logged = true;
        }
    }

    /// Serializes the durable log for shipment to the other data
    /// centers. Reads travel with the origin's observed version so the
    /// receiving side verifies against the same evidence.
    fn send_commit_record(
        &self,
        inner: &mut Inner,
        heard: &[PaxosGroupId],
        resend: bool,
        d: &TxMan,
    ) {
        let home = inner.group.id;
        if inner.record.is_none() {
            let origin_vote = match inner.local_outcome {
                Some(v) => v,
                None => return,
            };
            let mut reads = Vec::new();
            let mut writes = Vec::new();
            let mut terminal = None;
            for (idx, op) in inner.ops.iter().enumerate() {
                if !op.durable() {
                    break;
                }
                match op.entry() {
                    Some(LogEntry::Read { table, key }) => reads.push(RecordedRead {
                        seqno: idx as u64,
                        table: table.clone(),
                        key: key.clone(),
                        timestamp: op.read_timestamp,
                        value: op.read_value.clone(),
                    }),
                    Some(LogEntry::Write { table, key, value }) => writes.push(RecordedWrite {
                        seqno: idx as u64,
                        table: table.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    }),
                    Some(entry) if entry.is_terminal() => {
                        terminal = Some((idx as u64, entry.kind()));
                    }
                    _ => {}
                }
            }
            let (terminal_seqno, terminal) = match terminal {
                Some(t) => t,
                None => return,
            };
            let record = CommitRecord {
                tg: self.tg,
                timestamp: inner.timestamp,
                group: inner.group.clone(),
                dcs: inner.dcs.iter().map(|info| info.id).collect(),
                reads,
                writes,
                terminal_seqno,
                terminal,
                origin_vote,
            };
            match record.encode() {
                Ok(encoded) => inner.record = Some(encoded),
                Err(e) => {
                    warn!("{}: cannot serialize commit record: {}", self.tg, e);
                    return;
                }
            }
        }
        let record = match &inner.record {
            Some(r) => r.clone(),
            None => return,
        };
        for info in &mut inner.dcs {
            if info.id == home || heard.contains(&info.id) {
                continue;
            }
            let first = info.timestamp == 0;
            if first || resend {
                info.timestamp = 1;
                d.send_dc(
                    info.id,
                    PeerMessage::CommitRecord { tg: self.tg, record: record.clone() },
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // reply routing
    // ------------------------------------------------------------------

    /// Answers the client that proposed slot `idx`, once the durable
    /// entry and its key-value work make the answer known. The encoded
    /// bytes are cached so a duplicate retry replays them unchanged.
    fn maybe_reply(&self, inner: &mut Inner, idx: usize, d: &TxMan) {
        let op = &inner.ops[idx];
        let (client, nonce) = match op.origin {
            Some(o) => o,
            None => return,
        };
        if op.replied || !op.durable() {
            return;
        }
        let ready = match op.entry() {
            Some(LogEntry::Begin { .. }) => true,
            Some(LogEntry::Read { .. }) => op.failed.is_some() || op.kvs >= KvsPhase::ValueReady,
            Some(LogEntry::Write { .. }) => op.failed.is_some() || op.kvs >= KvsPhase::Locked,
            _ => false, // terminal replies wait for the decision
        };
        if !ready {
            return;
        }
        let response = self.compute_response(inner, idx, nonce);
        self.cache_and_send(inner, idx, client, &response, d);
    }

    fn reply_terminal(&self, inner: &mut Inner, d: &TxMan) {
        let idx = match inner.ops.iter().position(|op| {
            op.durable() && op.entry().map(|e| e.is_terminal()).unwrap_or(false)
        }) {
            Some(idx) => idx,
            None => return,
        };
        let (client, nonce) = match inner.ops[idx].origin {
            Some(o) => o,
            None => return,
        };
        if inner.ops[idx].replied {
            return;
        }
        let response = self.compute_response(inner, idx, nonce);
        self.cache_and_send(inner, idx, client, &response, d);
    }

    fn cache_and_send(
        &self,
        inner: &mut Inner,
        idx: usize,
        client: CommId,
        response: &ClientResponse,
        d: &TxMan,
    ) {
        match response.encode() {
            Ok(encoded) => {
                inner.ops[idx].reply = Some(encoded.clone());
                inner.ops[idx].replied = true;
                d.reply(client, encoded);
            }
            Err(e) => warn!("{}: cannot encode reply for slot {}: {}", self.tg, idx, e),
        }
    }

    /// The reply for slot `idx` as determined by the durable entry and
    /// the transaction's current knowledge.
    fn compute_response(&self, inner: &Inner, idx: usize, nonce: u64) -> ClientResponse {
        let op = &inner.ops[idx];
        match op.entry() {
            Some(LogEntry::Begin { .. }) => ClientResponse::Begin {
                nonce,
                status: ReturnCode::Success,
                tg: Some(self.tg),
            },
            Some(LogEntry::Read { .. }) => {
                if let Some(rc) = op.failed {
                    ClientResponse::Read { nonce, status: rc, value: None }
                } else if op.kvs >= KvsPhase::ValueReady {
                    let status = if op.read_value.is_some() {
                        ReturnCode::Success
                    } else {
                        ReturnCode::NotFound
                    };
                    ClientResponse::Read { nonce, status, value: op.read_value.clone() }
                } else {
                    ClientResponse::Read { nonce, status: ReturnCode::NonePending, value: None }
                }
            }
            Some(LogEntry::Write { .. }) => ClientResponse::Write {
                nonce,
                status: op.failed.unwrap_or(ReturnCode::Success),
            },
            Some(LogEntry::Prepare) => ClientResponse::Commit {
                nonce,
                status: match inner.global_outcome {
                    Some(VoteOutcome::Commit) => ReturnCode::Success,
                    Some(VoteOutcome::Abort) => ReturnCode::Aborted,
                    None => ReturnCode::NonePending,
                },
            },
            Some(LogEntry::Abort) => ClientResponse::Abort {
                nonce,
                status: match inner.global_outcome {
                    Some(VoteOutcome::Abort) => ReturnCode::Success,
                    Some(VoteOutcome::Commit) => ReturnCode::Garbage,
                    None => ReturnCode::NonePending,
                },
            },
            None => ClientResponse::Read { nonce, status: ReturnCode::NonePending, value: None },
        }
    }
}

fn resize_to_hold(inner: &mut Inner, idx: usize) {
    if idx >= inner.ops.len() {
        let us = inner.us;
        let members = inner.group.members.clone();
        inner
            .ops
            .resize_with(idx + 1, || Operation::empty(us, members.clone()));
    }
}

/// A committed write is settled once it is verified and any lock this
/// replica took is back.
fn write_done(op: &Operation) -> bool {
    if op.locked {
        op.kvs == KvsPhase::Released
    } else {
        op.kvs >= KvsPhase::WriteVerified
    }
}

/// A refusal reply matching the shape of the rejected request.
fn refusal(entry: &LogEntry, nonce: u64, status: ReturnCode) -> ClientResponse {
    match entry {
        LogEntry::Begin { .. } => ClientResponse::Begin { nonce, status, tg: None },
        LogEntry::Read { .. } => ClientResponse::Read { nonce, status, value: None },
        LogEntry::Write { .. } => ClientResponse::Write { nonce, status },
        LogEntry::Prepare => ClientResponse::Commit { nonce, status },
        LogEntry::Abort => ClientResponse::Abort { nonce, status },
    }
}
