use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire schema revision carried by every gossip entry.
pub const GOSSIP_SCHEMA: u32 = 1;

/// Milliseconds since the unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

// ============================================================================
// Node Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Worker => "worker",
        }
    }

    /// Reserved role names recognized during proxy path resolution.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "coordinator" => Some(Role::Coordinator),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Suspected,
    Dead,
}

/// Summary of one service running on a node, as advertised via gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub version: String,
    pub methods: Vec<String>,
    pub health: String,
}

/// Everything the cluster knows about one node, including self.
///
/// The owning node is the only writer of its own entry; `version` bumps on
/// every self-change so receivers can discard stale copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub port: u16,
    pub role: Role,
    pub capabilities: Vec<String>,
    /// Unix millis of the last accepted gossip involving this node.
    pub last_seen: u64,
    pub status: NodeStatus,
    pub metadata: BTreeMap<String, Value>,
    pub services: BTreeMap<String, ServiceSummary>,
    pub version: u64,
}

impl NodeInfo {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }
}

/// Gossip wire entry: the §3 fields plus the schema revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoWire {
    pub schema: u32,
    #[serde(flatten)]
    pub info: NodeInfo,
}

impl From<NodeInfo> for NodeInfoWire {
    fn from(info: NodeInfo) -> Self {
        Self {
            schema: GOSSIP_SCHEMA,
            info,
        }
    }
}

// ============================================================================
// Gossip Frame
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipFrame {
    pub from: String,
    pub nonce: String,
    pub entries: Vec<NodeInfoWire>,
}

// ============================================================================
// JSON-RPC Envelope
// ============================================================================

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: String,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<String>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id.into()),
        }
    }

    pub fn failure(id: Option<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// Certificate Provisioning
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRequest {
    pub node_id: String,
    /// Hex-encoded random token the requester is serving on its validator.
    pub challenge: String,
    pub ip_addresses: Vec<String>,
    pub dns_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_cert_fingerprint: Option<String>,
    /// Port of the requester's temporary challenge validator. Absent on
    /// older clients; the coordinator then falls back to its configured
    /// well-known validator port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertResponse {
    pub certificate: String,
    pub private_key: String,
    pub node_id: String,
    pub valid_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
    pub node_id: String,
    pub timestamp: u64,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub role: Role,
    pub version: u64,
    pub known_nodes: usize,
    pub alive_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_request_envelope_shape() {
        let req = RpcRequest::new("echo/say", serde_json::json!({"msg": "hi"}));
        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["method"], "echo/say");
        assert_eq!(encoded["params"]["msg"], "hi");
        assert!(encoded["id"].is_string());
    }

    #[test]
    fn rpc_response_omits_absent_fields() {
        let ok = RpcResponse::success("1", serde_json::json!({"pong": "x"}));
        let encoded = serde_json::to_string(&ok).unwrap();
        assert!(!encoded.contains("\"error\""));

        let err = RpcResponse::failure(Some("1".into()), -32601, "method not found");
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(!encoded.contains("\"result\""));
        assert!(encoded.contains("-32601"));
    }

    #[test]
    fn wire_entry_carries_schema_and_flattened_fields() {
        let info = NodeInfo {
            node_id: "w1".into(),
            address: "10.0.0.2".into(),
            port: 8801,
            role: Role::Worker,
            capabilities: vec!["rpc".into()],
            last_seen: 12345,
            status: NodeStatus::Alive,
            metadata: BTreeMap::new(),
            services: BTreeMap::new(),
            version: 7,
        };
        let wire: NodeInfoWire = info.into();
        let encoded = serde_json::to_value(&wire).unwrap();
        assert_eq!(encoded["schema"], 1);
        assert_eq!(encoded["node_id"], "w1");
        assert_eq!(encoded["version"], 7);

        let decoded: NodeInfoWire = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.info.node_id, "w1");
    }
}
