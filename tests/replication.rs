mod common;

use std::time::Duration;

use common::{count, exec, exec_on_leader, session, TestCluster};
use quorumlite::cluster::membership::Role;

/// Grow a single-node cluster to three voters, write, hand leadership to
/// the second node, write again, and read both rows back on the first.
#[tokio::test]
async fn test_grow_transfer_and_replicate() {
    let mut cluster = TestCluster::new();
    cluster.start(1, &[1]);
    cluster.start(2, &[]);
    cluster.start(3, &[]);
    cluster.wait_until_leader(1).await;

    let node1 = cluster.node(1).clone();
    let sid = session(&node1).await;
    for id in [2, 3] {
        node1
            .sessions
            .add(&sid, id, &common::address(id))
            .await
            .unwrap();
        node1.sessions.assign(&sid, id, Role::Voter).await.unwrap();
    }
    let nodes = node1.sessions.cluster(&sid).await.unwrap();
    assert_eq!(nodes.voter_count(), 3);

    exec(&node1, "CREATE TABLE test (n INT)").await.unwrap();
    exec(&node1, "INSERT INTO test VALUES (1)").await.unwrap();

    node1.sessions.transfer(&sid, 2).await.unwrap();
    cluster.wait_until_leader(2).await;

    let node2 = cluster.node(2).clone();
    exec(&node2, "INSERT INTO test VALUES (2)").await.unwrap();
    cluster.wait_caught_up(2, &[1, 3]).await;

    assert_eq!(count(&node1, "test").await, 2);
    assert_eq!(count(&cluster.node(3).clone(), "test").await, 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replicas_have_identical_state() {
    let cluster = TestCluster::voters(3).await;
    let leader = cluster.wait_for_leader().await;
    let state = cluster.node(leader).clone();

    exec(&state, "CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB)")
        .await
        .unwrap();
    exec(&state, "CREATE INDEX kv_v ON kv (v)").await.unwrap();
    for i in 0..20 {
        exec(&state, &format!("INSERT INTO kv VALUES ('k{i}', x'{i:02x}')"))
            .await
            .unwrap();
    }
    exec(&state, "DELETE FROM kv WHERE k = 'k3'").await.unwrap();
    // A failing batch leaves no trace anywhere.
    assert!(exec(&state, "INSERT INTO kv VALUES ('k4', NULL)").await.is_err());

    cluster.wait_caught_up(leader, &[1, 2, 3]).await;
    let expected = state.raft.fsm().checksum().unwrap();
    for id in 1..=3 {
        assert_eq!(cluster.node(id).raft.fsm().checksum().unwrap(), expected);
        assert_eq!(count(cluster.node(id), "kv").await, 19);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_is_caught_up_from_snapshot() {
    let mut cluster = TestCluster::with(|config| {
        config.cluster.snapshot_threshold = 8;
        config.cluster.snapshot_trailing = 2;
    });
    cluster.start(1, &[1]);
    cluster.wait_until_leader(1).await;
    let node1 = cluster.node(1).clone();

    exec(&node1, "CREATE TABLE t (n INT)").await.unwrap();
    for n in 0..30 {
        exec(&node1, &format!("INSERT INTO t VALUES ({n})"))
            .await
            .unwrap();
    }

    cluster.start(2, &[]);
    let sid = session(&node1).await;
    node1.sessions.add(&sid, 2, "node2").await.unwrap();
    node1.sessions.assign(&sid, 2, Role::Voter).await.unwrap();
    cluster.wait_caught_up(1, &[2]).await;

    let node2 = cluster.node(2).clone();
    assert_eq!(count(&node2, "t").await, 30);
    assert_eq!(
        node2.raft.fsm().checksum().unwrap(),
        node1.raft.fsm().checksum().unwrap()
    );
    assert_eq!(node2.raft.fsm().nodes().voter_count(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_leader_is_replaced_and_repaired() {
    let cluster = TestCluster::voters(3).await;
    let old = cluster.wait_for_leader().await;
    exec(cluster.node(old), "CREATE TABLE t (n INTEGER PRIMARY KEY)")
        .await
        .unwrap();

    cluster.network.isolate(old);
    let new = cluster.wait_for_leader().await;
    assert_ne!(new, old);
    exec(cluster.node(new), "INSERT INTO t VALUES (1)")
        .await
        .unwrap();

    // The isolated node loses its quorum and steps down.
    let mut status = cluster.node(old).raft.subscribe();
    tokio::time::timeout(common::TIMEOUT, status.wait_for(|s| !s.is_leader()))
        .await
        .unwrap()
        .unwrap();

    // Rejoining with a higher term may force one more election.
    cluster.network.heal_all();
    let (leader, _) = exec_on_leader(&cluster, "INSERT OR IGNORE INTO t VALUES (2)").await;
    cluster.wait_caught_up(leader, &[1, 2, 3]).await;
    for id in 1..=3 {
        assert_eq!(count(cluster.node(id), "t").await, 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_spare_receives_no_replication() {
    let mut cluster = TestCluster::new();
    cluster.start(1, &[1]);
    cluster.start(2, &[]);
    cluster.wait_until_leader(1).await;
    let node1 = cluster.node(1).clone();
    let sid = session(&node1).await;
    node1.sessions.add(&sid, 2, "node2").await.unwrap();

    exec(&node1, "CREATE TABLE t (n INT)").await.unwrap();
    exec(&node1, "INSERT INTO t VALUES (1)").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.node(2).raft.fsm().last_applied(), 0);

    node1
        .sessions
        .assign(&sid, 2, Role::Standby)
        .await
        .unwrap();
    cluster.wait_caught_up(1, &[2]).await;
    assert_eq!(count(cluster.node(2), "t").await, 1);
    cluster.shutdown().await;
}
