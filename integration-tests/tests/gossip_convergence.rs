mod common;

use std::time::Duration;

use common::{wait_until, TestCluster};
use loom_core::types::{NodeStatus, Role};

#[tokio::test(flavor = "multi_thread")]
async fn single_node_cluster_converges_to_itself() {
    let cluster = TestCluster::new().await;

    // Give the tick loop a couple of rounds: nothing to send, nothing
    // to learn.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let directory = cluster.coordinator().directory();
    let all = directory.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].node_id, "c1");
    assert!(cluster.coordinator().fabric.pool.stats().is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_learn_each_other_and_their_services() {
    let mut cluster = TestCluster::new().await;
    cluster.add_worker("w1").await;

    cluster.await_visibility("c1", "w1").await;
    cluster.await_visibility("w1", "c1").await;

    // Service metadata travelled with the membership digest.
    let w1_as_seen_by_c1 = cluster
        .coordinator()
        .directory()
        .lookup("w1")
        .unwrap();
    assert_eq!(w1_as_seen_by_c1.role, Role::Worker);
    let system = w1_as_seen_by_c1
        .services
        .get("system")
        .expect("w1's system service not advertised");
    assert!(system.methods.contains(&"ping".to_string()));

    let c1_as_seen_by_w1 = cluster.node("w1").directory().lookup("c1").unwrap();
    assert_eq!(c1_as_seen_by_w1.role, Role::Coordinator);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_cluster_fully_meshes() {
    let mut cluster = TestCluster::new().await;
    cluster.add_worker("w1").await;
    cluster.add_worker("w2").await;

    // Workers only bootstrap against the coordinator; they must learn
    // about each other through gossip relay.
    cluster.await_visibility("w1", "w2").await;
    cluster.await_visibility("w2", "w1").await;

    for observer in ["c1", "w1", "w2"] {
        let directory = cluster.node(observer).directory();
        wait_until(
            Duration::from_secs(15),
            &format!("{observer} to see 3 alive nodes"),
            move || {
                directory
                    .all()
                    .iter()
                    .filter(|n| n.status == NodeStatus::Alive)
                    .count()
                    == 3
            },
        )
        .await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn version_observations_are_monotonic() {
    let mut cluster = TestCluster::new().await;
    cluster.add_worker("w1").await;
    cluster.await_visibility("c1", "w1").await;

    let directory = cluster.coordinator().directory();
    let mut highest = 0;
    for _ in 0..20 {
        if let Some(info) = directory.lookup("w1") {
            assert!(
                info.version >= highest,
                "w1 version regressed: {} < {}",
                info.version,
                highest
            );
            highest = info.version;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    cluster.shutdown().await;
}
