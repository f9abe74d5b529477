//! Service loader scaffolding.
//!
//! Whether a service is built in or pluggable is a loader concern; the
//! fabric core only ever sees the method registry. Loaded services are
//! summarized into the self NodeInfo so peers discover them via gossip.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::FabricError;
use crate::rpc::proxy::Fabric;
use crate::rpc::registry::handler;
use crate::types::{unix_ms, NodeStatus, Role, ServiceSummary};

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str {
        "1.0.0"
    }
    /// Register methods and acquire resources.
    async fn initialize(&self, fabric: &Arc<Fabric>) -> Result<()>;
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ServiceLoader {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Initialize every service, then publish the resulting method map
    /// into the self NodeInfo (one version bump).
    pub async fn initialize_all(&self, fabric: &Arc<Fabric>) -> Result<()> {
        for service in &self.services {
            service.initialize(fabric).await?;
            info!("Service initialized: {}", service.name());
        }

        let versions: BTreeMap<&str, &str> = self
            .services
            .iter()
            .map(|s| (s.name(), s.version()))
            .collect();
        let methods = fabric.registry.public_methods_by_service();
        let summaries: BTreeMap<String, ServiceSummary> = methods
            .into_iter()
            .map(|(service, methods)| {
                let version = versions.get(service.as_str()).unwrap_or(&"1.0.0");
                (
                    service,
                    ServiceSummary {
                        version: version.to_string(),
                        methods,
                        health: "healthy".to_string(),
                    },
                )
            })
            .collect();

        fabric.directory.update_self(|info| {
            info.services = summaries;
        });
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for service in self.services.iter().rev() {
            if let Err(e) = service.shutdown().await {
                tracing::warn!("Service {} shutdown error: {e:#}", service.name());
            }
        }
    }
}

/// Built-in introspection service: liveness probe, node info and a
/// cluster summary assembled from the directory.
pub struct SystemService {
    started_ms: u64,
}

impl SystemService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_ms: unix_ms(),
        })
    }
}

#[async_trait]
impl Service for SystemService {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn initialize(&self, fabric: &Arc<Fabric>) -> Result<()> {
        let registry = &fabric.registry;

        registry.register(
            "system",
            "ping",
            true,
            "Liveness probe, echoes the given name",
            handler(|params| async move {
                let name = params
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(json!({ "pong": name }))
            }),
        )?;

        let directory = fabric.directory.clone();
        let started = self.started_ms;
        registry.register(
            "system",
            "info",
            true,
            "Identity and uptime of this node",
            handler(move |_| {
                let directory = directory.clone();
                async move {
                    let info = directory.self_info();
                    Ok(json!({
                        "node_id": info.node_id,
                        "role": info.role,
                        "address": info.address,
                        "port": info.port,
                        "version": info.version,
                        "capabilities": info.capabilities,
                        "uptime_seconds": (unix_ms() - started) / 1000,
                    }))
                }
            }),
        )?;

        let directory = fabric.directory.clone();
        let pool = fabric.pool.clone();
        registry.register(
            "system",
            "cluster",
            true,
            "Directory summary: nodes by status and role, advertised services",
            handler(move |_| {
                let directory = directory.clone();
                let pool = pool.clone();
                async move {
                    let nodes = directory.all();
                    let count = |status: NodeStatus| {
                        nodes.iter().filter(|n| n.status == status).count()
                    };
                    let node_docs: Vec<serde_json::Value> = nodes
                        .iter()
                        .map(|n| {
                            json!({
                                "node_id": n.node_id,
                                "role": n.role,
                                "address": n.address,
                                "port": n.port,
                                "status": n.status,
                                "version": n.version,
                                "services": n.services,
                            })
                        })
                        .collect();
                    Ok(json!({
                        "total_nodes": nodes.len(),
                        "alive": count(NodeStatus::Alive),
                        "suspected": count(NodeStatus::Suspected),
                        "dead": count(NodeStatus::Dead),
                        "coordinators": nodes
                            .iter()
                            .filter(|n| n.role == Role::Coordinator)
                            .count(),
                        "workers": nodes
                            .iter()
                            .filter(|n| n.role == Role::Worker)
                            .count(),
                        "nodes": node_docs,
                        "request_stats": pool.stats(),
                    }))
                }
            }),
        )?;

        Ok(())
    }
}

/// A service defined by closures, for embedders and tests that register
/// a handful of methods without a dedicated type.
pub struct InlineService {
    name: &'static str,
    version: &'static str,
    methods: Vec<(
        &'static str,
        bool,
        &'static str,
        crate::rpc::registry::Handler,
    )>,
}

impl InlineService {
    pub fn new(name: &'static str, version: &'static str) -> Self {
        Self {
            name,
            version,
            methods: Vec::new(),
        }
    }

    pub fn method(
        mut self,
        method: &'static str,
        description: &'static str,
        handler: crate::rpc::registry::Handler,
    ) -> Self {
        self.methods.push((method, true, description, handler));
        self
    }

    pub fn private_method(
        mut self,
        method: &'static str,
        description: &'static str,
        handler: crate::rpc::registry::Handler,
    ) -> Self {
        self.methods.push((method, false, description, handler));
        self
    }
}

#[async_trait]
impl Service for InlineService {
    fn name(&self) -> &'static str {
        self.name
    }
    fn version(&self) -> &'static str {
        self.version
    }

    async fn initialize(&self, fabric: &Arc<Fabric>) -> Result<()> {
        for (method, public, description, handler) in &self.methods {
            fabric
                .registry
                .register(self.name, method, *public, description, handler.clone())
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Ok(())
    }
}

/// Convenience used by handlers that want to fail with a service error.
pub fn service_error(message: impl Into<String>) -> FabricError {
    FabricError::Handler(message.into())
}
