//! Client-side call resolution: local dispatch or remote JSON-RPC.
//!
//! The proxy is a typed builder (`service(..).node(..).call(..)`) with a
//! path resolver on top that mimics fluent attribute chaining: each path
//! segment after the service is classified as a reserved role name, a
//! known node id, or a method name, in that order.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::directory::NodeDirectory;
use crate::error::FabricError;
use crate::pool::ConnectionPool;
use crate::rpc::registry::MethodRegistry;
use crate::types::{NodeStatus, Role, RpcRequest, RpcResponse};

/// Everything a call needs, passed explicitly instead of via globals.
pub struct Fabric {
    pub directory: Arc<NodeDirectory>,
    pub registry: Arc<MethodRegistry>,
    pub pool: Arc<ConnectionPool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// Execute under the caller's task against the local registry.
    Local,
    /// A specific node id.
    Node(String),
    /// Any alive node of the role; bound deterministically at call time.
    Role(Role),
}

#[derive(Clone)]
pub struct ServiceProxy {
    fabric: Arc<Fabric>,
}

impl ServiceProxy {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        Self { fabric }
    }

    pub fn service(&self, name: impl Into<String>) -> ServiceHandle {
        ServiceHandle {
            fabric: self.fabric.clone(),
            service: name.into(),
        }
    }

    /// Resolve a fluent attribute path (`["echo", "w1", "say"]`) into a
    /// bound call. Classification order per segment while the target is
    /// unbound: reserved role name, then known node id, then method.
    pub fn resolve(&self, path: &[&str]) -> Result<BoundCall, FabricError> {
        let [service, rest @ ..] = path else {
            return Err(FabricError::InvalidProxyPath("empty path".to_string()));
        };
        if rest.is_empty() {
            return Err(FabricError::InvalidProxyPath(format!(
                "{service}: path ends before a method segment"
            )));
        }

        let mut target = CallTarget::Local;
        let mut method: Option<&str> = None;

        for segment in rest {
            if method.is_some() {
                return Err(FabricError::InvalidProxyPath(format!(
                    "segment {segment:?} follows the method step"
                )));
            }
            if target == CallTarget::Local {
                if let Some(role) = Role::parse(segment) {
                    target = CallTarget::Role(role);
                    continue;
                }
                if self.fabric.directory.lookup(segment).is_some() {
                    target = CallTarget::Node(segment.to_string());
                    continue;
                }
            }
            method = Some(segment);
        }

        let method = method.ok_or_else(|| {
            FabricError::InvalidProxyPath(format!("{service}: no method segment in path"))
        })?;

        Ok(BoundCall {
            fabric: self.fabric.clone(),
            service: service.to_string(),
            target,
            method: method.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct ServiceHandle {
    fabric: Arc<Fabric>,
    service: String,
}

impl ServiceHandle {
    pub fn node(self, node_id: impl Into<String>) -> BoundTarget {
        BoundTarget {
            fabric: self.fabric,
            service: self.service,
            target: CallTarget::Node(node_id.into()),
        }
    }

    pub fn role(self, role: Role) -> BoundTarget {
        BoundTarget {
            fabric: self.fabric,
            service: self.service,
            target: CallTarget::Role(role),
        }
    }

    /// Local call: no target was bound.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, FabricError> {
        invoke(
            &self.fabric,
            &self.service,
            &CallTarget::Local,
            method,
            params,
        )
        .await
    }
}

#[derive(Clone)]
pub struct BoundTarget {
    fabric: Arc<Fabric>,
    service: String,
    target: CallTarget,
}

impl BoundTarget {
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, FabricError> {
        invoke(&self.fabric, &self.service, &self.target, method, params).await
    }
}

/// A fully resolved path from [`ServiceProxy::resolve`].
pub struct BoundCall {
    fabric: Arc<Fabric>,
    pub service: String,
    pub target: CallTarget,
    pub method: String,
}

impl std::fmt::Debug for BoundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundCall")
            .field("service", &self.service)
            .field("target", &self.target)
            .field("method", &self.method)
            .finish()
    }
}

impl BoundCall {
    pub async fn invoke(&self, params: Value) -> Result<Value, FabricError> {
        invoke(
            &self.fabric,
            &self.service,
            &self.target,
            &self.method,
            params,
        )
        .await
    }
}

async fn invoke(
    fabric: &Fabric,
    service: &str,
    target: &CallTarget,
    method: &str,
    params: Value,
) -> Result<Value, FabricError> {
    let node_id = match target {
        CallTarget::Local => None,
        CallTarget::Node(id) => Some(id.clone()),
        CallTarget::Role(role) => {
            // Deterministic: lowest alive node id of the role.
            let candidates = fabric.directory.lookup_by_role(*role);
            let chosen = candidates.into_iter().next().ok_or_else(|| {
                FabricError::UnknownTarget(format!("no alive {} node", role.as_str()))
            })?;
            Some(chosen)
        }
    };

    match node_id {
        None => call_local(fabric, service, method, params).await,
        Some(id) if id == fabric.directory.self_id() => {
            call_local(fabric, service, method, params).await
        }
        Some(id) => call_remote(fabric, &id, service, method, params).await,
    }
}

async fn call_local(
    fabric: &Fabric,
    service: &str,
    method: &str,
    params: Value,
) -> Result<Value, FabricError> {
    let key = MethodRegistry::method_key(service, method);
    let entry = fabric
        .registry
        .lookup(&key)
        .ok_or(FabricError::MethodNotFound(key))?;
    (entry.handler)(params).await
}

async fn call_remote(
    fabric: &Fabric,
    node_id: &str,
    service: &str,
    method: &str,
    params: Value,
) -> Result<Value, FabricError> {
    let info = fabric
        .directory
        .lookup(node_id)
        .ok_or_else(|| FabricError::UnknownTarget(node_id.to_string()))?;
    if info.status == NodeStatus::Dead {
        return Err(FabricError::UnknownTarget(format!("{node_id} is dead")));
    }

    let request = RpcRequest::new(MethodRegistry::method_key(service, method), params);
    debug!(
        "Remote call {} -> {} ({})",
        request.method, node_id, info.address
    );

    let client = fabric.pool.client(node_id)?;
    let mut builder = client
        .post(format!("{}/rpc", info.base_url()))
        .header("x-loom-node", fabric.directory.self_id())
        .json(&request);
    if let Some(token) = fabric.pool.bearer_token() {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let result = builder.send().await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            fabric.pool.record_failure(node_id);
            return Err(fabric.pool.classify_error(err));
        }
    };

    let status = response.status();
    if status.as_u16() == 429 {
        fabric.pool.record_failure(node_id);
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(1);
        return Err(FabricError::RateLimited { retry_after_secs });
    }
    if status.as_u16() == 401 {
        fabric.pool.record_failure(node_id);
        return Err(FabricError::AuthFailed(format!(
            "{node_id} rejected credentials"
        )));
    }
    if !status.is_success() {
        fabric.pool.record_failure(node_id);
        return Err(FabricError::Transport(format!(
            "{node_id} returned HTTP {status}"
        )));
    }

    let envelope: RpcResponse = response.json().await.map_err(|err| {
        fabric.pool.record_failure(node_id);
        FabricError::Transport(format!("malformed response from {node_id}: {err}"))
    })?;

    match envelope.error {
        Some(remote) => {
            fabric.pool.record_success(node_id);
            Err(FabricError::Remote {
                code: remote.code,
                message: remote.message,
                data: remote.data,
            })
        }
        None => {
            fabric.pool.record_success(node_id);
            Ok(envelope.result.unwrap_or(Value::Null))
        }
    }
}
