use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Error kinds that cross the RPC fabric boundary.
///
/// Retriable kinds (see [`FabricError::is_retriable`]) may be retried by
/// callers with backoff; terminal kinds indicate a programming error or a
/// policy rejection and must surface immediately.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("duplicate method registration: {0}")]
    DuplicateMethod(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("invalid proxy path: {0}")]
    InvalidProxyPath(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("certificate provisioning failed: {0}")]
    CertProvisioning(String),

    /// A bug. Logged and surfaced to the top-level supervisor, never
    /// mapped to a retriable condition.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An application error raised inside a registered handler.
    #[error("{0}")]
    Handler(String),
}

impl FabricError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FabricError::Timeout(_)
                | FabricError::Transport(_)
                | FabricError::CertProvisioning(_)
                | FabricError::RateLimited { .. }
        )
    }

    /// JSON-RPC error code used when this error crosses the dispatcher
    /// boundary. Parse failures (-32700) are produced by the dispatcher
    /// itself and never take this path.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            FabricError::MethodNotFound(_) => -32601,
            FabricError::RateLimited { .. } => -32000,
            FabricError::Timeout(_) | FabricError::Transport(_) => -32001,
            FabricError::Remote { code, .. } => *code,
            _ => -32002,
        }
    }
}

impl From<anyhow::Error> for FabricError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FabricError>() {
            Ok(fabric) => fabric,
            Err(other) => FabricError::Handler(format!("{other:#}")),
        }
    }
}
