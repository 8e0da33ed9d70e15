use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

use crate::log_entry::{proposal_wins, LogEntry};
use crate::types::CommId;

/// A Paxos ballot, ordered by round number and then proposer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot<I> {
    pub number: u64,
    pub leader: I,
}

/// Messages of the single-decree Paxos used for the local and global
/// commit votes. `I` is the participant identity (a replica for the
/// local vote, a data-center group for the global vote).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteMsg<I, V> {
    Phase1A { b: Ballot<I> },
    Phase1B { b: Ballot<I>, accepted: Option<(Ballot<I>, V)> },
    Phase2A { b: Ballot<I>, v: V },
    Phase2B { b: Ballot<I> },
    Learn { v: V },
}

/// One single-decree Paxos instance deciding a vote value.
///
/// Proposer, acceptor, and learner roles live in the same object; a
/// participant that never proposes simply never populates the proposer
/// half. Duplicated and reordered messages are harmless, and any message
/// arriving after the decision is answered with `Learn`.
pub struct VotePaxos<I, V> {
    us: I,
    members: Vec<I>,
    // acceptor
    promised: Option<Ballot<I>>,
    accepted: Option<(Ballot<I>, V)>,
    // proposer
    proposing: Option<V>,
    ballot: Option<Ballot<I>>,
    phase1: HashMap<I, Option<(Ballot<I>, V)>>,
    phase2: HashSet<I>,
    chosen: Option<V>,
    // learner
    learned: Option<V>,
}

impl<I, V> VotePaxos<I, V>
where
    I: Copy + Eq + Ord + Hash,
    V: Clone + Eq,
{
    pub fn new(us: I, members: Vec<I>) -> Self {
        Self {
            us,
            members,
            promised: None,
            accepted: None,
            proposing: None,
            ballot: None,
            phase1: HashMap::new(),
            phase2: HashSet::new(),
            chosen: None,
            learned: None,
        }
    }

    pub fn learned(&self) -> Option<&V> {
        self.learned.as_ref()
    }

    /// Installs the membership the first time it becomes known. An
    /// instance created before the participant list arrives can still
    /// act as an acceptor; it only needs the members to propose.
    pub fn set_members(&mut self, members: Vec<I>) {
        if self.members.is_empty() {
            self.members = members;
        }
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn peers(&self) -> Vec<I> {
        self.members.iter().copied().filter(|m| *m != self.us).collect()
    }

    /// Starts (or restarts, at a higher ballot) a proposal for `v`.
    /// Returns the messages to send; the decision may already be reached
    /// when the group is a single member.
    pub fn propose(&mut self, v: V) -> Vec<(I, VoteMsg<I, V>)> {
        if self.learned.is_some() {
            return Vec::new();
        }
        let number = self
            .promised
            .map(|b| b.number)
            .max(self.ballot.map(|b| b.number))
            .unwrap_or(0)
            + 1;
        let b = Ballot { number, leader: self.us };
        self.proposing = Some(v);
        self.ballot = Some(b);
        self.phase1.clear();
        self.phase2.clear();
        self.chosen = None;
        // self-promise and self-vote
        self.promised = Some(b);
        self.phase1.insert(self.us, self.accepted.clone());
        let mut out: Vec<(I, VoteMsg<I, V>)> = self
            .peers()
            .into_iter()
            .map(|p| (p, VoteMsg::Phase1A { b }))
            .collect();
        out.extend(self.maybe_finish_phase1());
        out
    }

    fn maybe_finish_phase1(&mut self) -> Vec<(I, VoteMsg<I, V>)> {
        if self.chosen.is_some() || self.phase1.len() < self.quorum() {
            return Vec::new();
        }
        let b = match self.ballot {
            Some(b) => b,
            None => return Vec::new(),
        };
        // adopt the highest previously accepted value, if any
        let mut adopted: Option<(Ballot<I>, V)> = None;
        for acc in self.phase1.values().flatten() {
            if adopted.as_ref().map_or(true, |(ab, _)| acc.0 > *ab) {
                adopted = Some(acc.clone());
            }
        }
        let v = match (adopted, &self.proposing) {
            (Some((_, v)), _) => v,
            (None, Some(v)) => v.clone(),
            (None, None) => return Vec::new(),
        };
        self.chosen = Some(v.clone());
        self.accepted = Some((b, v.clone()));
        self.phase2.clear();
        self.phase2.insert(self.us);
        let mut out: Vec<(I, VoteMsg<I, V>)> = self
            .peers()
            .into_iter()
            .map(|p| (p, VoteMsg::Phase2A { b, v: v.clone() }))
            .collect();
        out.extend(self.maybe_finish_phase2());
        out
    }

    fn maybe_finish_phase2(&mut self) -> Vec<(I, VoteMsg<I, V>)> {
        if self.learned.is_some() || self.phase2.len() < self.quorum() {
            return Vec::new();
        }
        let v = match &self.chosen {
            Some(v) => v.clone(),
            None => return Vec::new(),
        };
        self.learned = Some(v.clone());
        self.peers()
            .into_iter()
            .map(|p| (p, VoteMsg::Learn { v: v.clone() }))
            .collect()
    }

    /// Processes one inbound message and returns the messages to send in
    /// response.
    pub fn process(&mut self, from: I, msg: VoteMsg<I, V>) -> Vec<(I, VoteMsg<I, V>)> {
        if let VoteMsg::Learn { v } = msg {
            if self.learned.is_none() {
                self.learned = Some(v);
            }
            return Vec::new();
        }
        if let Some(v) = &self.learned {
            // decided long ago; help the straggler along
            return vec![(from, VoteMsg::Learn { v: v.clone() })];
        }
        match msg {
            VoteMsg::Phase1A { b } => {
                if self.promised.map_or(true, |p| b >= p) {
                    self.promised = Some(b);
                    vec![(from, VoteMsg::Phase1B { b, accepted: self.accepted.clone() })]
                } else {
                    Vec::new()
                }
            }
            VoteMsg::Phase1B { b, accepted } => {
                if self.ballot == Some(b) && self.proposing.is_some() {
                    self.phase1.insert(from, accepted);
                    self.maybe_finish_phase1()
                } else {
                    Vec::new()
                }
            }
            VoteMsg::Phase2A { b, v } => {
                if self.promised.map_or(true, |p| b >= p) {
                    self.promised = Some(b);
                    self.accepted = Some((b, v));
                    vec![(from, VoteMsg::Phase2B { b })]
                } else {
                    Vec::new()
                }
            }
            VoteMsg::Phase2B { b } => {
                if self.ballot == Some(b) && self.chosen.is_some() {
                    self.phase2.insert(from);
                    self.maybe_finish_phase2()
                } else {
                    Vec::new()
                }
            }
            VoteMsg::Learn { .. } => unreachable!("handled above"),
        }
    }

    /// Retransmits whatever phase is outstanding. Invoked from the
    /// background tick; every message it produces is idempotent.
    pub fn tick(&mut self) -> Vec<(I, VoteMsg<I, V>)> {
        if let Some(v) = &self.learned {
            if self.ballot.is_some() {
                // we decided; make sure everyone hears it
                let v = v.clone();
                return self
                    .peers()
                    .into_iter()
                    .map(|p| (p, VoteMsg::Learn { v: v.clone() }))
                    .collect();
            }
            return Vec::new();
        }
        let b = match self.ballot {
            Some(b) => b,
            None => return Vec::new(),
        };
        if let Some(v) = &self.chosen {
            let v = v.clone();
            self.peers()
                .into_iter()
                .filter(|p| !self.phase2.contains(p))
                .map(|p| (p, VoteMsg::Phase2A { b, v: v.clone() }))
                .collect()
        } else if self.proposing.is_some() {
            self.peers()
                .into_iter()
                .filter(|p| !self.phase1.contains_key(p))
                .map(|p| (p, VoteMsg::Phase1A { b }))
                .collect()
        } else {
            Vec::new()
        }
    }
}

/// Outcome of offering a proposal to a slot's synod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// The proposal is now the slot's held entry.
    Accepted,
    /// The identical entry was already held.
    Duplicate,
    /// A deterministically stronger proposal already holds the slot.
    Superseded,
    /// The slot is durable with a different payload; the proposal is
    /// rejected and the finalized entry answers instead.
    Finalized,
}

/// The per-slot acceptance tracker of a transaction's replicated log.
///
/// A slot holds at most one entry at a time; competing proposals resolve
/// by [`proposal_wins`], which is deterministic in the entry bytes, so
/// every replica converges on the same entry without extra message
/// rounds. Acknowledgements only count toward the currently held entry,
/// and durability (a home-group majority) freezes the slot for good.
pub struct Synod {
    us: CommId,
    members: Vec<CommId>,
    entry: Option<(LogEntry, Bytes)>,
    acks: HashSet<CommId>,
    durable: bool,
}

impl Synod {
    pub fn new(us: CommId, members: Vec<CommId>) -> Self {
        Self {
            us,
            members,
            entry: None,
            acks: HashSet::new(),
            durable: false,
        }
    }

    /// Installs an entry already known to be durable (recovery, or
    /// synthesis from a remote data center's commit record).
    pub fn seed_durable(us: CommId, members: Vec<CommId>, entry: LogEntry, encoded: Bytes) -> Self {
        let mut synod = Self::new(us, members);
        synod.acks = members_set(&synod.members);
        synod.entry = Some((entry, encoded));
        synod.durable = true;
        synod
    }

    fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn propose(&mut self, entry: LogEntry, encoded: Bytes) -> Acceptance {
        enum Held {
            Empty,
            Identical,
            Frozen,
            Weaker,
            Stronger,
        }
        let held = match &self.entry {
            None => Held::Empty,
            Some((_, held)) if *held == encoded => Held::Identical,
            Some(_) if self.durable => Held::Frozen,
            Some((held_entry, held)) => {
                if proposal_wins((entry.kind(), encoded.as_ref()), (held_entry.kind(), held.as_ref()))
                {
                    Held::Weaker
                } else {
                    Held::Stronger
                }
            }
        };
        match held {
            Held::Empty => {
                self.entry = Some((entry, encoded));
                self.acks.clear();
                self.acks.insert(self.us);
                self.maybe_durable();
                Acceptance::Accepted
            }
            Held::Identical => {
                self.acks.insert(self.us);
                self.maybe_durable();
                Acceptance::Duplicate
            }
            Held::Frozen => Acceptance::Finalized,
            Held::Weaker => {
                self.entry = Some((entry, encoded));
                self.acks.clear();
                self.acks.insert(self.us);
                Acceptance::Accepted
            }
            Held::Stronger => Acceptance::Superseded,
        }
    }

    /// Records a peer acknowledgement; returns true when the slot just
    /// became durable.
    pub fn ack(&mut self, from: CommId) -> bool {
        if self.entry.is_none() || !self.members.contains(&from) {
            return false;
        }
        let was = self.durable;
        self.acks.insert(from);
        self.maybe_durable();
        self.durable && !was
    }

    fn maybe_durable(&mut self) {
        if !self.durable && self.acks.len() >= self.quorum() {
            self.durable = true;
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn entry(&self) -> Option<&LogEntry> {
        self.entry.as_ref().map(|(e, _)| e)
    }

    pub fn encoded(&self) -> Option<&Bytes> {
        self.entry.as_ref().map(|(_, b)| b)
    }
}

fn members_set(members: &[CommId]) -> HashSet<CommId> {
    members.iter().copied().collect()
}
