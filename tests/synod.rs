//! Unit-level coverage of the per-slot synod and the vote Paxos.

use txman::paxos::{Acceptance, Synod, VoteMsg, VotePaxos};
use txman::{CommId, LogEntry, VoteOutcome};

fn ids(n: u64) -> Vec<CommId> {
    (1..=n).map(CommId).collect()
}

#[test]
fn synod_majority_makes_durable() {
    let mut synod = Synod::new(CommId(1), ids(3));
    let entry = LogEntry::Prepare;
    let encoded = entry.encode().unwrap();
    assert_eq!(synod.propose(entry, encoded), Acceptance::Accepted);
    assert!(!synod.is_durable());
    assert!(synod.ack(CommId(2)));
    assert!(synod.is_durable());
    // further acks change nothing
    assert!(!synod.ack(CommId(3)));
}

#[test]
fn synod_durable_slot_is_frozen() {
    let mut synod = Synod::new(CommId(1), ids(3));
    let prepare = LogEntry::Prepare;
    synod.propose(prepare.clone(), prepare.encode().unwrap());
    synod.ack(CommId(2));
    let abort = LogEntry::Abort;
    assert_eq!(
        synod.propose(abort.clone(), abort.encode().unwrap()),
        Acceptance::Finalized
    );
    assert_eq!(synod.entry(), Some(&prepare));
}

#[test]
fn synod_abort_outranks_prepare_before_durability() {
    let mut synod = Synod::new(CommId(1), ids(3));
    let prepare = LogEntry::Prepare;
    synod.propose(prepare.clone(), prepare.encode().unwrap());
    let abort = LogEntry::Abort;
    assert_eq!(
        synod.propose(abort.clone(), abort.encode().unwrap()),
        Acceptance::Accepted
    );
    // the replaced proposal's acks were discarded
    assert!(!synod.is_durable());
    assert_eq!(synod.entry(), Some(&abort));
    // the losing entry re-offered cannot displace the winner
    assert_eq!(
        synod.propose(prepare.clone(), prepare.encode().unwrap()),
        Acceptance::Superseded
    );
}

#[test]
fn synod_identical_reproposal_is_idempotent() {
    let mut synod = Synod::new(CommId(1), ids(3));
    let entry = LogEntry::Prepare;
    let encoded = entry.encode().unwrap();
    assert_eq!(synod.propose(entry.clone(), encoded.clone()), Acceptance::Accepted);
    assert_eq!(synod.propose(entry, encoded), Acceptance::Duplicate);
}

#[test]
fn vote_paxos_three_members_decide() {
    let members = ids(3);
    let mut a = VotePaxos::new(CommId(1), members.clone());
    let mut b = VotePaxos::new(CommId(2), members.clone());
    let mut c = VotePaxos::new(CommId(3), members);
    let mut inflight: Vec<(CommId, CommId, VoteMsg<CommId, VoteOutcome>)> = a
        .propose(VoteOutcome::Commit)
        .into_iter()
        .map(|(to, m)| (CommId(1), to, m))
        .collect();
    while let Some((from, to, msg)) = inflight.pop() {
        let node = match to {
            CommId(1) => &mut a,
            CommId(2) => &mut b,
            _ => &mut c,
        };
        for (next_to, next_msg) in node.process(from, msg) {
            inflight.push((to, next_to, next_msg));
        }
    }
    assert_eq!(a.learned(), Some(&VoteOutcome::Commit));
    assert_eq!(b.learned(), Some(&VoteOutcome::Commit));
    assert_eq!(c.learned(), Some(&VoteOutcome::Commit));
}

#[test]
fn vote_paxos_single_member_decides_immediately() {
    let mut solo: VotePaxos<CommId, VoteOutcome> = VotePaxos::new(CommId(7), vec![CommId(7)]);
    let out = solo.propose(VoteOutcome::Abort);
    assert!(out.is_empty());
    assert_eq!(solo.learned(), Some(&VoteOutcome::Abort));
}

#[test]
fn vote_paxos_straggler_is_caught_up() {
    let members = ids(3);
    let mut a = VotePaxos::new(CommId(1), members.clone());
    let mut b = VotePaxos::new(CommId(2), members.clone());
    // decide between a and b only
    let mut inflight: Vec<(CommId, CommId, VoteMsg<CommId, VoteOutcome>)> = a
        .propose(VoteOutcome::Commit)
        .into_iter()
        .filter(|(to, _)| *to == CommId(2))
        .map(|(to, m)| (CommId(1), to, m))
        .collect();
    while let Some((from, to, msg)) = inflight.pop() {
        let node = if to == CommId(1) { &mut a } else { &mut b };
        for (next_to, next_msg) in node.process(from, msg) {
            if next_to == CommId(1) || next_to == CommId(2) {
                inflight.push((to, next_to, next_msg));
            }
        }
    }
    assert_eq!(a.learned(), Some(&VoteOutcome::Commit));

    // the third member asks late and is answered with the decision
    let mut c = VotePaxos::new(CommId(3), members);
    let out = c.propose(VoteOutcome::Abort);
    let mut caught_up = false;
    for (to, msg) in out {
        if to == CommId(1) {
            for (_, reply) in a.process(CommId(3), msg) {
                if let VoteMsg::Learn { v } = reply {
                    c.process(CommId(1), VoteMsg::Learn { v });
                    caught_up = true;
                }
            }
        }
    }
    assert!(caught_up);
    assert_eq!(c.learned(), Some(&VoteOutcome::Commit));
}
