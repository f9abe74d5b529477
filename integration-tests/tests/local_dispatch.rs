mod common;

use common::TestCluster;
use loom_core::error::FabricError;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn local_ping_round_trips_without_touching_the_network() {
    let cluster = TestCluster::new().await;
    let proxy = cluster.coordinator().proxy();

    let result = proxy
        .service("system")
        .call("ping", json!({ "name": "x" }))
        .await
        .expect("local ping failed");
    assert_eq!(result, json!({ "pong": "x" }));

    // A purely local call leaves no trace in the connection pool stats.
    let stats = cluster.coordinator().fabric.pool.stats();
    assert!(stats.is_empty(), "local call produced network activity: {stats:?}");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_returns_method_not_found() {
    let cluster = TestCluster::new().await;
    let proxy = cluster.coordinator().proxy();

    let err = proxy
        .service("nope")
        .call("missing", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::MethodNotFound(_)));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fluent_path_resolution_binds_against_the_live_directory() {
    let cluster = TestCluster::new().await;
    let proxy = cluster.coordinator().proxy();

    // system/ping resolves with no target: second segment is a method.
    let call = proxy.resolve(&["system", "ping"]).unwrap();
    let result = call.invoke(json!({ "name": "resolver" })).await.unwrap();
    assert_eq!(result["pong"], "resolver");

    // coordinator is a reserved role name; self is the only coordinator,
    // so the call stays local.
    let call = proxy.resolve(&["system", "coordinator", "ping"]).unwrap();
    let result = call.invoke(json!({ "name": "role" })).await.unwrap();
    assert_eq!(result["pong"], "role");

    // Segments after the method step are a programming error.
    let err = proxy.resolve(&["system", "ping", "extra"]).unwrap_err();
    assert!(matches!(err, FabricError::InvalidProxyPath(_)));

    cluster.shutdown().await;
}
