use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;

use crate::messages::PeerMessage;
use crate::paxos::{VoteMsg, VotePaxos};
use crate::txman::TxMan;
use crate::types::{CommId, PaxosGroupId, TransactionGroup, VoteOutcome};

/// The home group's Paxos on this data center's vote for one
/// transaction. The leader proposes commit or abort from its local
/// evidence; the decided value is the data center's contribution to the
/// global vote.
pub struct LocalVoter {
    tg: TransactionGroup,
    mtx: Mutex<VotePaxos<CommId, VoteOutcome>>,
}

impl LocalVoter {
    pub fn new(tg: TransactionGroup, us: CommId, members: Vec<CommId>) -> Self {
        Self {
            tg,
            mtx: Mutex::new(VotePaxos::new(us, members)),
        }
    }

    pub fn outcome(&self) -> Option<VoteOutcome> {
        self.mtx.lock().learned().copied()
    }

    /// Leader entry point. Re-proposing after a decision is a no-op, so
    /// tick-driven retries are safe.
    pub fn propose(&self, v: VoteOutcome, d: &TxMan) {
        let out = self.mtx.lock().propose(v);
        debug!("{}: local vote proposes {}", self.tg, v);
        self.dispatch(out, d);
    }

    /// Handles one vote message; returns the outcome when this message
    /// just decided it.
    pub fn process(&self, from: CommId, msg: VoteMsg<CommId, VoteOutcome>, d: &TxMan) -> Option<VoteOutcome> {
        let (out, newly) = {
            let mut paxos = self.mtx.lock();
            let before = paxos.learned().is_some();
            let out = paxos.process(from, msg);
            let newly = !before && paxos.learned().is_some();
            (out, newly.then(|| paxos.learned().copied()).flatten())
        };
        self.dispatch(out, d);
        newly
    }

    pub fn tick(&self, d: &TxMan) {
        let out = self.mtx.lock().tick();
        self.dispatch(out, d);
    }

    fn dispatch(&self, out: Vec<(CommId, VoteMsg<CommId, VoteOutcome>)>, d: &TxMan) {
        for (to, msg) in out {
            d.send(to, PeerMessage::LvVote { tg: self.tg, msg });
        }
    }
}

struct GlobalState {
    dcs: Vec<PaxosGroupId>,
    outcomes: HashMap<PaxosGroupId, VoteOutcome>,
    own: Option<VoteOutcome>,
    paxos: VotePaxos<PaxosGroupId, VoteOutcome>,
    proposed: bool,
}

/// The cross-data-center vote on one transaction. Each participating
/// data center broadcasts its local outcome; the initiating data center
/// aggregates and drives a Paxos among the data centers on the global
/// decision, which is commit only when every vote was commit.
pub struct GlobalVoter {
    tg: TransactionGroup,
    us_dc: PaxosGroupId,
    mtx: Mutex<GlobalState>,
}

impl GlobalVoter {
    pub fn new(tg: TransactionGroup, us_dc: PaxosGroupId) -> Self {
        Self {
            tg,
            us_dc,
            mtx: Mutex::new(GlobalState {
                dcs: Vec::new(),
                outcomes: HashMap::new(),
                own: None,
                paxos: VotePaxos::new(us_dc, Vec::new()),
                proposed: false,
            }),
        }
    }

    /// Installs the participant list the first time it becomes known
    /// (from the begin entry or an inbound commit record).
    pub fn set_dcs(&self, dcs: &[PaxosGroupId]) {
        let mut state = self.mtx.lock();
        if state.dcs.is_empty() && !dcs.is_empty() {
            state.dcs = dcs.to_vec();
            state.paxos.set_members(dcs.to_vec());
        }
    }

    pub fn outcome(&self) -> Option<VoteOutcome> {
        self.mtx.lock().paxos.learned().copied()
    }

    /// Data centers this voter has heard a local outcome from.
    pub fn heard_from(&self) -> Vec<PaxosGroupId> {
        self.mtx.lock().outcomes.keys().copied().collect()
    }

    /// Records this data center's own local outcome and announces it to
    /// the other participants.
    pub fn record_local(&self, outcome: VoteOutcome, d: &TxMan) {
        let (announce, drive) = {
            let mut state = self.mtx.lock();
            let first = state.own.is_none();
            state.own = Some(outcome);
            state.outcomes.insert(self.us_dc, outcome);
            (first, self.aggregate_locked(&mut state))
        };
        if announce {
            self.announce(outcome, d);
        }
        self.dispatch(drive, d);
    }

    /// Records another data center's local outcome.
    pub fn record_outcome(&self, dc: PaxosGroupId, outcome: VoteOutcome, d: &TxMan) -> Option<VoteOutcome> {
        let (drive, newly) = {
            let mut state = self.mtx.lock();
            let before = state.paxos.learned().is_some();
            state.outcomes.insert(dc, outcome);
            let drive = self.aggregate_locked(&mut state);
            let newly = !before && state.paxos.learned().is_some();
            (drive, newly.then(|| state.paxos.learned().copied()).flatten())
        };
        self.dispatch(drive, d);
        newly
    }

    /// Handles one global-vote Paxos message from another data center.
    pub fn process(
        &self,
        from: PaxosGroupId,
        msg: VoteMsg<PaxosGroupId, VoteOutcome>,
        d: &TxMan,
    ) -> Option<VoteOutcome> {
        let (out, newly) = {
            let mut state = self.mtx.lock();
            let before = state.paxos.learned().is_some();
            let out = state.paxos.process(from, msg);
            let newly = !before && state.paxos.learned().is_some();
            (out, newly.then(|| state.paxos.learned().copied()).flatten())
        };
        self.dispatch(out, d);
        newly
    }

    pub fn tick(&self, d: &TxMan) {
        let (own, missing, drive) = {
            let mut state = self.mtx.lock();
            let missing: Vec<PaxosGroupId> = state
                .dcs
                .iter()
                .copied()
                .filter(|dc| *dc != self.us_dc && !state.outcomes.contains_key(dc))
                .collect();
            (state.own, missing, state.paxos.tick())
        };
        // re-announce our outcome to anyone we have not heard back from
        if let Some(outcome) = own {
            for dc in missing {
                d.send_dc(
                    dc,
                    PeerMessage::GvPropose { tg: self.tg, dc: self.us_dc, outcome },
                );
            }
        }
        self.dispatch(drive, d);
    }

    /// Initiating-DC side: once every participant has voted, propose the
    /// aggregate. Unanimous commit commits; anything else aborts.
    fn aggregate_locked(
        &self,
        state: &mut GlobalState,
    ) -> Vec<(PaxosGroupId, VoteMsg<PaxosGroupId, VoteOutcome>)> {
        if state.proposed
            || self.us_dc != self.tg.group
            || state.dcs.is_empty()
            || !state.dcs.iter().all(|dc| state.outcomes.contains_key(dc))
        {
            return Vec::new();
        }
        let unanimous = state
            .dcs
            .iter()
            .all(|dc| state.outcomes.get(dc) == Some(&VoteOutcome::Commit));
        let decision = if unanimous { VoteOutcome::Commit } else { VoteOutcome::Abort };
        debug!("{}: global vote proposes {}", self.tg, decision);
        state.proposed = true;
        state.paxos.propose(decision)
    }

    fn announce(&self, outcome: VoteOutcome, d: &TxMan) {
        let dcs = self.mtx.lock().dcs.clone();
        for dc in dcs {
            if dc != self.us_dc {
                d.send_dc(
                    dc,
                    PeerMessage::GvPropose { tg: self.tg, dc: self.us_dc, outcome },
                );
            }
        }
    }

    fn dispatch(&self, out: Vec<(PaxosGroupId, VoteMsg<PaxosGroupId, VoteOutcome>)>, d: &TxMan) {
        for (to, msg) in out {
            d.send_dc(to, PeerMessage::GvVote { tg: self.tg, msg });
        }
    }
}
