//! Crash and takeover behavior: a peer finishing a decided commit after
//! the leader dies, and a restarted replica catching up from its
//! durable log.

use std::sync::Arc;

use txman::{ClientRequest, ClientResponse, LogStore, ReturnCode, TxMan, TxState, VoteOutcome};

mod common;
use common::{b, Cluster, LoopbackTransport, CLIENT};

#[test]
fn peer_takes_over_and_retransmits_commit_record() {
    let cluster = Cluster::new(&[3, 1]);
    let leader = cluster.leader_of(0);
    let remote = cluster.leader_of(1);

    // the remote data center is unreachable, so the record cannot leave
    cluster.net.set_down(remote, true);

    let tg = cluster.begin(leader);
    cluster.client(
        leader,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.client(leader, ClientRequest::Commit { tg, nonce: 3, seqno: 2 });
    cluster.net.take_replies();

    // prepare is durable and the local vote is decided, but the global
    // outcome is stuck behind the partition
    let txn = cluster.node(leader).d.transaction_handle(tg).unwrap();
    assert_eq!(txn.state(), TxState::GlobalCommitVote);

    // the leader crashes; a peer takes over and the partition heals
    cluster.net.set_down(leader, true);
    cluster.set_offline(vec![leader]);
    cluster.net.set_down(remote, false);
    cluster.tick();
    cluster.tick();

    // the takeover leader retransmitted the record; the outcome is the
    // same commit the old leader was driving
    let new_leader = cluster.groups[0].members[1];
    for id in [new_leader, cluster.groups[0].members[2], remote] {
        let node = cluster.node(id);
        let txn = node.d.transaction_handle(tg).expect("transaction missing");
        assert!(
            txn.state() >= TxState::Committed && txn.state() != TxState::Aborted,
            "{:?} on {}",
            txn.state(),
            id
        );
        assert_eq!(node.log.get_decision(tg).unwrap(), Some(VoteOutcome::Commit));
    }
    assert_eq!(
        cluster.dc(1).latest("T", "k").map(|(_, v)| v),
        Some(b("v")),
        "remote data center must apply the committed write"
    );
}

#[test]
fn restart_replays_durable_log_and_finishes() {
    let cluster = Cluster::new(&[1]);
    let solo = cluster.leader_of(0);
    let tg = cluster.begin(solo);
    cluster.client(
        solo,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.client(solo, ClientRequest::Commit { tg, nonce: 3, seqno: 2 });
    cluster.net.take_replies();
    assert_eq!(cluster.dc(0).applied_writes().len(), 1);

    // a fresh daemon over the same durable log and store
    let node = cluster.node(solo);
    let transport = Arc::new(LoopbackTransport::new(solo, cluster.net.clone()));
    let d2 = TxMan::new(
        node.config.clone(),
        node.log.clone(),
        cluster.dc(0).clone(),
        transport,
    );
    let txn = d2.transaction_handle(tg).expect("recovery must rebuild the transaction");
    assert_eq!(
        txn.durable_entry(2).map(|e| e.kind()),
        Some(txman::LogEntryKind::Prepare)
    );

    // one tick re-drives the machine to the persisted decision; the
    // store calls are idempotent replays
    d2.handle(txman::Event::Tick);
    d2.drain_kvs();
    assert!(txn.state() >= TxState::Committed && txn.state() != TxState::Aborted);
    assert_eq!(cluster.dc(0).applied_writes().len(), 1, "no duplicate effects");
}

#[test]
fn restart_before_commit_accepts_the_commit_later() {
    let cluster = Cluster::new(&[1]);
    let solo = cluster.leader_of(0);
    let tg = cluster.begin(solo);
    cluster.client(
        solo,
        ClientRequest::Write { tg, nonce: 2, seqno: 1, table: b("T"), key: b("k"), value: b("v") },
    );
    cluster.net.take_replies();

    let node = cluster.node(solo);
    let transport = Arc::new(LoopbackTransport::new(solo, cluster.net.clone()));
    let d2 = TxMan::new(
        node.config.clone(),
        node.log.clone(),
        cluster.dc(0).clone(),
        transport,
    );
    d2.handle(txman::Event::Tick);
    d2.drain_kvs();

    // the client's commit lands on the restarted daemon
    d2.handle(txman::Event::Client {
        from: CLIENT,
        req: ClientRequest::Commit { tg, nonce: 3, seqno: 2 },
    });
    d2.drain_kvs();
    let replies = cluster.net.take_replies();
    assert!(
        replies
            .iter()
            .any(|(_, r)| matches!(r, ClientResponse::Commit { nonce: 3, status: ReturnCode::Success })),
        "expected the restarted daemon to finish the commit, got {:?}",
        replies
    );
    assert_eq!(cluster.dc(0).applied_writes().len(), 1);
}
