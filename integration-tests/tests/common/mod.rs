#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use loom_core::config::Config;
use loom_core::node::{NodeBuilder, NodeHandle};
use loom_core::services::Service;
use loom_core::store::MemStore;
use loom_core::types::Role;

/// Find a free TCP port by binding to port 0
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

/// Wait until `check` returns true, or panic after `timeout`.
pub async fn wait_until<F>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Fast cluster timings so membership tests finish in seconds.
pub fn test_config(node_id: &str, role: Role) -> Config {
    let mut config = Config::for_node(node_id, role);
    config.bind_address = "127.0.0.1".parse().unwrap();
    config.listen_port = 0; // ephemeral
    config.cert_validator_http_port = find_free_port();
    config.gossip_interval_min_seconds = 1;
    config.gossip_interval_max_seconds = 2;
    config.suspect_timeout_seconds = 3;
    config.dead_timeout_seconds = 6;
    config.evict_timeout_seconds = 120;
    config
}

/// An in-process cluster of nodes sharing nothing but the loopback
/// network.
pub struct TestCluster {
    pub nodes: Vec<NodeHandle>,
}

impl TestCluster {
    /// Start a coordinator on ephemeral ports.
    pub async fn new() -> Self {
        Self::with_coordinator_config(test_config("c1", Role::Coordinator), Vec::new()).await
    }

    pub async fn with_coordinator_config(
        config: Config,
        services: Vec<Arc<dyn Service>>,
    ) -> Self {
        let mut builder = NodeBuilder::new(config).with_store(MemStore::new());
        for service in services {
            builder = builder.add_service(service);
        }
        let coordinator = builder.start().await.expect("Failed to start coordinator");
        Self {
            nodes: vec![coordinator],
        }
    }

    pub fn coordinator(&self) -> &NodeHandle {
        &self.nodes[0]
    }

    /// Point a worker config at the coordinator's listeners.
    pub fn worker_config(&self, node_id: &str) -> Config {
        let coordinator = self.coordinator();
        let mut config = test_config(node_id, Role::Worker);
        config.bootstrap_coordinators = vec![coordinator.rpc_addr().to_string()];
        config.bootstrap_provisioning = vec![coordinator
            .provisioning_addr()
            .expect("coordinator exposes provisioning")
            .to_string()];
        config
    }

    pub async fn add_worker(&mut self, node_id: &str) -> &NodeHandle {
        self.add_worker_with_services(node_id, Vec::new()).await
    }

    pub async fn add_worker_with_services(
        &mut self,
        node_id: &str,
        services: Vec<Arc<dyn Service>>,
    ) -> &NodeHandle {
        let config = self.worker_config(node_id);
        let mut builder = NodeBuilder::new(config).with_store(MemStore::new());
        for service in services {
            builder = builder.add_service(service);
        }
        let worker = builder.start().await.expect("Failed to start worker");
        self.nodes.push(worker);
        self.nodes.last().unwrap()
    }

    pub fn node(&self, node_id: &str) -> &NodeHandle {
        self.nodes
            .iter()
            .find(|node| node.config.node_id == node_id)
            .expect("unknown node id")
    }

    /// Wait until `observer` sees `target` as alive.
    pub async fn await_visibility(&self, observer: &str, target: &str) {
        let directory = self.node(observer).directory();
        let target_id = target.to_string();
        wait_until(
            Duration::from_secs(20),
            &format!("{observer} to see {target}"),
            move || {
                directory
                    .lookup(&target_id)
                    .map(|info| info.status == loom_core::types::NodeStatus::Alive)
                    .unwrap_or(false)
            },
        )
        .await;
    }

    pub async fn shutdown(self) {
        // Workers first, coordinator last.
        for node in self.nodes.into_iter().rev() {
            node.shutdown().await;
        }
    }
}
