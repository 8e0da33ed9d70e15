//! Targeted checks of the coordinator's invariants: monotone lifecycle,
//! durable-slot immutability, a single terminal entry, lock liberation,
//! and collection after quiescence.

use bytes::Bytes;
use txman::{ClientRequest, ClientResponse, Event, LogEntry, PeerMessage, ReturnCode, TxState};

mod common;
use common::{b, Cluster};

fn rank(state: TxState) -> u8 {
    match state {
        TxState::Initialized => 0,
        TxState::Executing => 1,
        TxState::LocalCommitVote => 2,
        TxState::GlobalCommitVote => 3,
        TxState::Committed | TxState::Aborted => 4,
        TxState::Terminated => 5,
        TxState::Collected => 6,
    }
}

#[test]
fn state_is_monotone_across_the_lifecycle() {
    let cluster = Cluster::new(&[3]);
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);
    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();

    let mut seen = vec![rank(txn.state())];
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    seen.push(rank(txn.state()));
    cluster.client(leader, ClientRequest::Commit { tg, nonce: 3, seqno: 2 });
    seen.push(rank(txn.state()));
    cluster.tick();
    seen.push(rank(txn.state()));
    cluster.tick();
    seen.push(rank(txn.state()));

    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1], "state went backward: {:?}", seen);
    }
}

#[test]
fn durable_slot_rejects_conflicting_proposal() {
    let cluster = Cluster::new(&[3]);
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.net.take_replies();

    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();
    let before = txn.durable_entry(1).expect("slot 1 must be durable");

    // a conflicting proposal arrives for the finalized slot
    let evil = LogEntry::Write { table: b("T"), key: b("k"), value: b("EVIL") };
    let payload: Bytes = evil.encode().unwrap();
    let peer = cluster.groups[0].members[1];
    cluster.node(leader).d.handle(Event::Peer {
        from: peer,
        msg: PeerMessage::Paxos2A { tg, seqno: 1, kind: evil.kind(), payload },
    });
    cluster.pump();

    assert_eq!(txn.durable_entry(1), Some(before), "durable payload must not change");
}

#[test]
fn no_operation_lands_past_the_terminal_entry() {
    let cluster = Cluster::new(&[3]);
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.client(leader, ClientRequest::Commit { tg, nonce: 3, seqno: 2 });
    cluster.net.take_replies();

    cluster.client(leader, ClientRequest::Abort { tg, nonce: 4, seqno: 3 });
    let replies = cluster.net.take_replies();
    assert!(
        replies
            .iter()
            .any(|(_, r)| matches!(r, ClientResponse::Abort { nonce: 4, status: ReturnCode::Aborted })),
        "an abort after the terminal entry must be refused, got {:?}",
        replies
    );
    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();
    assert_eq!(txn.durable_entry(3), None);
}

#[test]
fn aborting_releases_every_acquired_lock() {
    let cluster = Cluster::new(&[3]);
    cluster.dc(0).seed("T", "k", 10, "old");
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);

    cluster.client(
        leader,
        ClientRequest::Read { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k") },
    );
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 3, seqno: 2, table: b("T"), key: b("k2"), value: b("v") },
    );
    cluster.net.take_replies();
    assert_eq!(cluster.dc(0).held_locks(), 2);

    cluster.client(leader, ClientRequest::Abort { tg, nonce: 4, seqno: 3 });
    cluster.net.take_replies();
    assert_eq!(cluster.dc(0).held_locks(), 0);
    assert_eq!(cluster.dc(0).unlock_count(), 2);
    assert!(cluster.dc(0).applied_writes().is_empty());
}

#[test]
fn injected_abort_closes_the_log_and_releases_locks() {
    let cluster = Cluster::new(&[3]);
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.net.take_replies();
    assert_eq!(cluster.dc(0).held_locks(), 1);

    // an abort arrives from outside the client command stream
    cluster.node(leader).d.abort_transaction(tg);
    cluster.pump();

    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();
    assert_eq!(txn.state(), TxState::Terminated);
    assert!(matches!(txn.durable_entry(2), Some(LogEntry::Abort)));
    assert_eq!(cluster.dc(0).held_locks(), 0);
    assert!(cluster.dc(0).applied_writes().is_empty());
}

#[test]
fn terminated_transactions_are_collected_after_quiescence() {
    let cluster = Cluster::new(&[3]);
    let leader = cluster.leader_of(0);
    let tg = cluster.begin(leader);
    cluster.client(leader, ClientRequest::Commit { tg, nonce: 2, seqno: 1 });
    cluster.net.take_replies();

    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();
    assert_eq!(txn.state(), TxState::Terminated);

    // two quiescence ticks, one sweep
    cluster.tick();
    cluster.tick();
    cluster.tick();
    assert!(
        cluster.node(leader).d.transaction_handle(tg).is_none(),
        "collected transaction must leave the map"
    );
}
