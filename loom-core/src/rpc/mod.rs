//! Server side of the RPC fabric: the JSON-RPC endpoint plus the fixed
//! internal paths (health, gossip, certificate provisioning).
//!
//! Requests are admitted by the rate guard, authenticated per the
//! configured policy, then dispatched against the method registry.
//! Concurrency comes from the HTTP server; no ordering is promised
//! across in-flight requests.

pub mod proxy;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};

use crate::ca::provisioner::{challenge_router, ChallengeSlot};
use crate::ca::{CertAuthority, IssueError};
use crate::error::FabricError;
use crate::gossip::Gossip;
use crate::ratelimit::{EndpointClass, RateGuard};
use crate::rpc::proxy::Fabric;
use crate::types::{HealthResponse, RpcRequest, RpcResponse, JSONRPC_VERSION};

/// How callers prove themselves on the TLS listener. Under mTLS the
/// handshake itself is the proof; bearer mode checks a cluster token.
#[derive(Clone)]
pub enum AuthPolicy {
    Mtls,
    Bearer { token: String },
}

pub struct AppState {
    pub fabric: Arc<Fabric>,
    pub gossip: Arc<Gossip>,
    pub guard: Arc<RateGuard>,
    pub auth: AuthPolicy,
    pub ca: Option<Arc<CertAuthority>>,
    pub default_validator_port: u16,
}

impl AppState {
    fn health_doc(&self) -> HealthResponse {
        let info = self.fabric.directory.self_info();
        let all = self.fabric.directory.all();
        let alive = all
            .iter()
            .filter(|n| n.status == crate::types::NodeStatus::Alive)
            .count();
        HealthResponse {
            status: "ok".to_string(),
            node_id: info.node_id,
            role: info.role,
            version: info.version,
            known_nodes: all.len(),
            alive_nodes: alive,
        }
    }
}

/// The full router served over TLS on the main listener.
pub fn main_router(state: Arc<AppState>, challenge_slot: ChallengeSlot) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/internal/gossip", post(handle_gossip))
        .route("/internal/ca-cert", get(handle_ca_cert))
        .route("/internal/cert-request", post(handle_cert_request))
        .with_state(state)
        .merge(challenge_router(challenge_slot))
}

/// The plain-HTTP bootstrap subset a coordinator exposes on the
/// well-known validator port, reachable by workers that hold no
/// certificate yet.
pub fn provisioning_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/internal/ca-cert", get(handle_ca_cert))
        .route("/internal/cert-request", post(handle_cert_request))
        .with_state(state)
}

/// Caller identity for rate limiting: the authenticated node id when the
/// peer presented one, else the source IP.
fn caller_identity(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get("x-loom-node")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn check_auth(policy: &AuthPolicy, headers: &HeaderMap) -> Result<(), FabricError> {
    match policy {
        // The rustls client verifier already rejected unauthenticated
        // peers during the handshake.
        AuthPolicy::Mtls => Ok(()),
        AuthPolicy::Bearer { token } => {
            let presented = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "));
            match presented {
                Some(presented) if presented == token => Ok(()),
                Some(_) => Err(FabricError::AuthFailed("invalid bearer token".into())),
                None => Err(FabricError::AuthFailed("missing bearer token".into())),
            }
        }
    }
}

fn rate_limited_response(id: Option<String>, retry_after_secs: u64) -> Response {
    let body = RpcResponse::failure(id, -32000, "rate limited");
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = retry_after_secs.to_string().parse() {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = caller_identity(&headers, &peer);

    if let Err(FabricError::RateLimited { retry_after_secs }) =
        state.guard.check(EndpointClass::Rpc, &caller)
    {
        return rate_limited_response(None, retry_after_secs);
    }

    if let Err(e) = check_auth(&state.auth, &headers) {
        warn!("Rejected /rpc call from {caller}: {e}");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Unparseable /rpc body from {caller}: {e}");
            return Json(RpcResponse::failure(None, -32700, "parse error")).into_response();
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        return Json(RpcResponse::failure(
            Some(request.id),
            -32600,
            "unsupported jsonrpc version",
        ))
        .into_response();
    }

    // Method names carry exactly one service/method separator.
    if request.method.matches('/').count() != 1 {
        return Json(RpcResponse::failure(
            Some(request.id),
            -32601,
            format!("malformed method name: {}", request.method),
        ))
        .into_response();
    }

    let Some(entry) = state.fabric.registry.lookup(&request.method) else {
        return Json(RpcResponse::failure(
            Some(request.id),
            -32601,
            format!("method not found: {}", request.method),
        ))
        .into_response();
    };

    match (entry.handler)(request.params).await {
        Ok(result) => Json(RpcResponse::success(request.id, result)).into_response(),
        Err(FabricError::RateLimited { retry_after_secs }) => {
            rate_limited_response(Some(request.id), retry_after_secs)
        }
        Err(e @ FabricError::AuthFailed(_)) => (
            StatusCode::UNAUTHORIZED,
            Json(RpcResponse::failure(
                Some(request.id),
                e.jsonrpc_code(),
                e.to_string(),
            )),
        )
            .into_response(),
        Err(e) => Json(RpcResponse::failure(
            Some(request.id),
            e.jsonrpc_code(),
            e.to_string(),
        ))
        .into_response(),
    }
}

async fn handle_health(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let caller = caller_identity(&headers, &peer);
    if let Err(FabricError::RateLimited { retry_after_secs }) =
        state.guard.check(EndpointClass::Health, &caller)
    {
        let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
        if let Ok(value) = retry_after_secs.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }
    (StatusCode::OK, Json(state.health_doc())).into_response()
}

async fn handle_gossip(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = caller_identity(&headers, &peer);
    // Internal class: no admission limit.
    let _ = state.guard.check(EndpointClass::Internal, &caller);

    if let Err(e) = check_auth(&state.auth, &headers) {
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    match state.gossip.handle_frame(&body) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            // Gossip failures never propagate to application code.
            debug!("Dropped gossip frame from {caller}: {e:#}");
            (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" }))).into_response()
        }
    }
}

async fn handle_ca_cert(State(state): State<Arc<AppState>>) -> Response {
    match &state.ca {
        Some(ca) => (StatusCode::OK, ca.ca_cert_pem().to_string()).into_response(),
        None => (StatusCode::FORBIDDEN, "not a coordinator").into_response(),
    }
}

async fn handle_cert_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<crate::types::CertRequest>,
) -> Response {
    let Some(ca) = &state.ca else {
        return (StatusCode::FORBIDDEN, "not a coordinator").into_response();
    };

    let validator_port = request
        .validator_port
        .unwrap_or(state.default_validator_port);

    match ca
        .handle_cert_request(request, peer.ip(), validator_port)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(IssueError::BadRequest(msg)) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Err(IssueError::Forbidden(msg)) => (StatusCode::FORBIDDEN, msg).into_response(),
        Err(IssueError::Unavailable(msg)) => {
            (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
        }
        Err(IssueError::Internal(e)) => {
            warn!("Certificate issuance failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "issuance failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryTimeouts, NodeDirectory};
    use crate::gossip::{Gossip, GossipConfig};
    use crate::pool::ConnectionPool;
    use crate::ratelimit::ClassLimits;
    use crate::rpc::registry::{handler, MethodRegistry};
    use crate::types::{unix_ms, NodeInfo, NodeStatus, Role};
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(auth: AuthPolicy, rpc_limits: ClassLimits) -> (Arc<AppState>, Router) {
        let directory = NodeDirectory::new(
            NodeInfo {
                node_id: "c1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 8801,
                role: Role::Coordinator,
                capabilities: vec![],
                last_seen: unix_ms(),
                status: NodeStatus::Alive,
                metadata: BTreeMap::new(),
                services: BTreeMap::new(),
                version: 1,
            },
            DirectoryTimeouts::from_secs(30, 90, 600),
        );
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(5), 8));
        let fabric = Arc::new(Fabric {
            directory: directory.clone(),
            registry: MethodRegistry::new(),
            pool: pool.clone(),
        });
        let (signals, _rx) = tokio::sync::mpsc::channel(4);
        let gossip = Gossip::new(
            directory,
            pool,
            GossipConfig {
                interval_min: Duration::from_secs(5),
                interval_max: Duration::from_secs(30),
                max_targets: 5,
                compression_threshold: 1024,
            },
            signals,
        );
        let state = Arc::new(AppState {
            fabric,
            gossip,
            guard: Arc::new(RateGuard::new(
                true,
                rpc_limits,
                ClassLimits {
                    per_min: 300,
                    burst: 50,
                },
            )),
            auth,
            ca: None,
            default_validator_port: 8802,
        });
        let slot: ChallengeSlot = Arc::new(Mutex::new(None));
        let router = main_router(state.clone(), slot);
        (state, router)
    }

    fn rpc_body(method: &str, params: serde_json::Value) -> Body {
        Body::from(
            serde_json::to_vec(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": "test-1",
            }))
            .unwrap(),
        )
    }

    fn rpc_request(method: &str, params: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(rpc_body(method, params))
            .unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn limits(per_min: u32, burst: u32) -> ClassLimits {
        ClassLimits { per_min, burst }
    }

    #[tokio::test]
    async fn dispatches_registered_method() {
        let (state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        state
            .fabric
            .registry
            .register(
                "system",
                "ping",
                true,
                "",
                handler(|params| async move {
                    Ok(json!({ "pong": params["name"] }))
                }),
            )
            .unwrap();

        let response = router
            .oneshot(rpc_request("system/ping", json!({ "name": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["result"]["pong"], "x");
        assert_eq!(body["id"], "test-1");
    }

    #[tokio::test]
    async fn unknown_method_maps_to_32601() {
        let (_state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        let response = router
            .oneshot(rpc_request("no/such", json!({})))
            .await
            .unwrap();
        let body = response_json(response).await;
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_method_name_is_rejected() {
        let (_state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        let response = router
            .oneshot(rpc_request("nomethodseparator", json!({})))
            .await
            .unwrap();
        let body = response_json(response).await;
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn parse_error_maps_to_32700() {
        let (_state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(Body::from("{not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let body = response_json(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn bearer_auth_rejects_missing_and_wrong_tokens() {
        let (_state, router) = test_state(
            AuthPolicy::Bearer {
                token: "s3cret".to_string(),
            },
            limits(100, 20),
        );

        let response = router
            .clone()
            .oneshot(rpc_request("system/ping", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = rpc_request("system/ping", json!({}));
        request
            .headers_mut()
            .insert("authorization", "Bearer wrong".parse().unwrap());
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct token gets past auth (and then misses the registry).
        let mut request = rpc_request("system/ping", json!({}));
        request
            .headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_returns_429_with_retry_after() {
        let (_state, router) = test_state(AuthPolicy::Mtls, limits(5, 2));

        let mut saw_429 = false;
        for _ in 0..4 {
            let response = router
                .clone()
                .oneshot(rpc_request("a/b", json!({})))
                .await
                .unwrap();
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                assert!(response.headers().contains_key("retry-after"));
                let body = response_json(response).await;
                assert_eq!(body["error"]["code"], -32000);
                saw_429 = true;
                break;
            }
        }
        assert!(saw_429, "expected a 429 within the burst window");
    }

    #[tokio::test]
    async fn health_reports_cluster_counts() {
        let (state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        state.fabric.directory.upsert(NodeInfo {
            node_id: "w1".to_string(),
            address: "127.0.0.2".to_string(),
            port: 8801,
            role: Role::Worker,
            capabilities: vec![],
            last_seen: unix_ms(),
            status: NodeStatus::Alive,
            metadata: BTreeMap::new(),
            services: BTreeMap::new(),
            version: 1,
        });

        let request = Request::builder()
            .uri("/health")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node_id"], "c1");
        assert_eq!(body["known_nodes"], 2);
    }

    #[tokio::test]
    async fn ca_cert_requires_coordinator_mode() {
        let (_state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));
        let request = Request::builder()
            .uri("/internal/ca-cert")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn gossip_endpoint_accepts_frames_and_updates_directory() {
        let (state, router) = test_state(AuthPolicy::Mtls, limits(100, 20));

        let frame = crate::types::GossipFrame {
            from: "w1".to_string(),
            nonce: "n1".to_string(),
            entries: vec![crate::types::NodeInfoWire::from(NodeInfo {
                node_id: "w1".to_string(),
                address: "127.0.0.2".to_string(),
                port: 8801,
                role: Role::Worker,
                capabilities: vec![],
                last_seen: unix_ms(),
                status: NodeStatus::Alive,
                metadata: BTreeMap::new(),
                services: BTreeMap::new(),
                version: 3,
            })],
        };
        let body = crate::gossip::wire::encode_frame(&frame, 1024).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/internal/gossip")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.fabric.directory.lookup("w1").unwrap().version,
            3
        );
    }
}
