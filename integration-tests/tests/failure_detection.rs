mod common;

use std::time::Duration;

use common::{wait_until, TestCluster};
use loom_core::error::FabricError;
use loom_core::types::NodeStatus;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn stopped_worker_decays_to_dead_and_calls_fail_with_unknown_target() {
    let mut cluster = TestCluster::new().await;
    cluster.add_worker("w1").await;
    cluster.await_visibility("c1", "w1").await;

    // Take w1 off the network.
    let w1 = cluster.nodes.pop().unwrap();
    assert_eq!(w1.config.node_id, "w1");
    w1.shutdown().await;

    // c1 stops hearing from w1; with suspect=3s/dead=6s the entry must
    // decay through suspected into dead without skipping a stage.
    let directory = cluster.coordinator().directory();
    let dir = directory.clone();
    wait_until(Duration::from_secs(10), "w1 to be suspected", move || {
        dir.lookup("w1")
            .map(|info| info.status != NodeStatus::Alive)
            .unwrap_or(false)
    })
    .await;

    let dir = directory.clone();
    wait_until(Duration::from_secs(20), "w1 to be dead", move || {
        dir.lookup("w1")
            .map(|info| info.status == NodeStatus::Dead)
            .unwrap_or(false)
    })
    .await;

    // Dead targets are unreachable through the proxy.
    let err = cluster
        .coordinator()
        .proxy()
        .service("any")
        .node("w1")
        .call("m", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::UnknownTarget(_)));

    // The entry itself survives until the eviction timeout so a
    // rejoining node can be reconciled.
    assert!(directory.lookup("w1").is_some());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_worker_is_visible_again_within_a_round() {
    let mut cluster = TestCluster::new().await;

    // Start w1 with a store we keep across the restart: the persisted
    // self-version is what lets the new incarnation supersede the old
    // entry at the coordinator.
    let store = loom_core::store::MemStore::new();
    let config = cluster.worker_config("w1");
    let w1 = loom_core::node::NodeBuilder::new(config)
        .with_store(store.clone())
        .start()
        .await
        .unwrap();
    cluster.await_visibility("c1", "w1").await;
    let old_version = cluster
        .coordinator()
        .directory()
        .lookup("w1")
        .unwrap()
        .version;
    w1.shutdown().await;

    let directory = cluster.coordinator().directory();
    let dir = directory.clone();
    wait_until(Duration::from_secs(20), "w1 to be dead", move || {
        dir.lookup("w1")
            .map(|info| info.status == NodeStatus::Dead)
            .unwrap_or(false)
    })
    .await;

    // Same node id rejoins on new ports with the retained store. Its
    // announce plus one gossip round make it alive again.
    let mut config = cluster.worker_config("w1");
    config.cert_validator_http_port = common::find_free_port();
    let w1 = loom_core::node::NodeBuilder::new(config)
        .with_store(store)
        .start()
        .await
        .unwrap();
    cluster.await_visibility("c1", "w1").await;

    let seen = cluster.coordinator().directory().lookup("w1").unwrap();
    assert!(
        seen.version > old_version,
        "rejoined incarnation did not advance the version"
    );

    let result = cluster
        .coordinator()
        .proxy()
        .service("system")
        .node("w1")
        .call("ping", json!({ "name": "back" }))
        .await
        .expect("rejoined worker unreachable");
    assert_eq!(result["pong"], "back");

    w1.shutdown().await;
    cluster.shutdown().await;
}
