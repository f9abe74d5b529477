//! Per-peer TLS client pool.
//!
//! Clients are keyed by node id, not address, so they survive a peer
//! changing its advertised address. A client built against an old CA
//! fingerprint is discarded on next lookup and rebuilt against the
//! currently trusted CA.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::error::FabricError;
use crate::types::unix_ms;

const MAX_IDLE_PER_PEER: usize = 4;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// TLS material the pool builds clients from: the trusted CA plus the
/// local leaf for client auth under mTLS.
#[derive(Clone)]
pub struct TlsIdentity {
    pub ca_pem: String,
    pub ca_fingerprint: String,
    pub cert_pem: String,
    pub key_pem: String,
}

struct PooledClient {
    client: reqwest::Client,
    ca_fingerprint: String,
    last_used: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PeerStats {
    pub requests: u64,
    pub failures: u64,
}

pub struct ConnectionPool {
    identity: RwLock<Option<TlsIdentity>>,
    clients: DashMap<String, PooledClient>,
    max_clients: usize,
    deadline: Duration,
    stats: DashMap<String, PeerStats>,
    /// Cluster token attached to outbound calls in bearer-auth mode.
    bearer: RwLock<Option<String>>,
}

impl ConnectionPool {
    pub fn new(deadline: Duration, max_clients: usize) -> Self {
        Self {
            identity: RwLock::new(None),
            clients: DashMap::new(),
            max_clients,
            deadline,
            stats: DashMap::new(),
            bearer: RwLock::new(None),
        }
    }

    pub fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer.write() = token;
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.bearer.read().clone()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Swap in new TLS material (initial install or rotation). Existing
    /// clients are invalidated lazily via the fingerprint check.
    pub fn set_identity(&self, identity: TlsIdentity) {
        *self.identity.write() = Some(identity);
    }

    pub fn has_identity(&self) -> bool {
        self.identity.read().is_some()
    }

    pub fn trusted_fingerprint(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.ca_fingerprint.clone())
    }

    fn build_client(&self, identity: &TlsIdentity) -> Result<reqwest::Client> {
        let ca_cert = reqwest::Certificate::from_pem(identity.ca_pem.as_bytes())
            .context("Failed to parse CA certificate")?;

        let mut identity_pem = identity.cert_pem.clone().into_bytes();
        identity_pem.extend_from_slice(identity.key_pem.as_bytes());
        let client_identity = reqwest::Identity::from_pem(&identity_pem)
            .context("Failed to parse client identity")?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.deadline)
            .add_root_certificate(ca_cert)
            .identity(client_identity)
            .pool_max_idle_per_host(MAX_IDLE_PER_PEER)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(client)
    }

    /// Get (or rebuild) the client for a peer. Fails with Transport until
    /// TLS material is installed.
    pub fn client(&self, node_id: &str) -> std::result::Result<reqwest::Client, FabricError> {
        let identity = self.identity.read();
        let Some(identity) = identity.as_ref() else {
            return Err(FabricError::Transport(
                "no TLS identity installed yet".to_string(),
            ));
        };

        if let Some(entry) = self.clients.get(node_id) {
            if entry.ca_fingerprint == identity.ca_fingerprint {
                entry.last_used.store(unix_ms(), Ordering::Relaxed);
                return Ok(entry.client.clone());
            }
            drop(entry);
            debug!("Discarding client for {} built against stale CA", node_id);
            self.clients.remove(node_id);
        }

        let client = self
            .build_client(identity)
            .map_err(|e| FabricError::Transport(format!("{e:#}")))?;

        self.clients.insert(
            node_id.to_string(),
            PooledClient {
                client: client.clone(),
                ca_fingerprint: identity.ca_fingerprint.clone(),
                last_used: AtomicU64::new(unix_ms()),
            },
        );
        self.evict_over_cap();

        Ok(client)
    }

    fn evict_over_cap(&self) {
        while self.clients.len() > self.max_clients {
            let lru = self
                .clients
                .iter()
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            match lru {
                Some(key) => {
                    debug!("Evicting least-recently-used client for {}", key);
                    self.clients.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn record_success(&self, node_id: &str) {
        self.stats.entry(node_id.to_string()).or_default().requests += 1;
    }

    pub fn record_failure(&self, node_id: &str) {
        let mut entry = self.stats.entry(node_id.to_string()).or_default();
        entry.requests += 1;
        entry.failures += 1;
    }

    pub fn stats(&self) -> BTreeMap<String, PeerStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Map a reqwest failure onto the fabric error kinds.
    pub fn classify_error(&self, err: reqwest::Error) -> FabricError {
        if err.is_timeout() {
            FabricError::Timeout(self.deadline)
        } else {
            FabricError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::certs::{fingerprint_pem, generate_ca, CertSigner};

    fn identity_from(ca: &crate::ca::certs::CaMaterial) -> TlsIdentity {
        let signer = CertSigner::from_material(ca).unwrap();
        let leaf = signer
            .issue_leaf("c1", &["127.0.0.1".to_string()], &["localhost".to_string()])
            .unwrap();
        TlsIdentity {
            ca_pem: ca.cert_pem.clone(),
            ca_fingerprint: fingerprint_pem(&ca.cert_pem).unwrap(),
            cert_pem: leaf.cert_pem,
            key_pem: leaf.key_pem,
        }
    }

    #[test]
    fn lookup_fails_before_identity_is_installed() {
        crate::tls::install_crypto_provider();
        let pool = ConnectionPool::new(Duration::from_secs(10), 8);
        assert!(matches!(
            pool.client("w1"),
            Err(FabricError::Transport(_))
        ));
    }

    #[test]
    fn clients_are_reused_until_ca_rotates() {
        crate::tls::install_crypto_provider();
        let pool = ConnectionPool::new(Duration::from_secs(10), 8);

        let ca1 = generate_ca("Mesh CA 1").unwrap();
        pool.set_identity(identity_from(&ca1));
        pool.client("w1").unwrap();
        assert_eq!(pool.clients.len(), 1);
        pool.client("w1").unwrap();
        assert_eq!(pool.clients.len(), 1);

        // New trust root: the cached client must be rebuilt.
        let ca2 = generate_ca("Mesh CA 2").unwrap();
        pool.set_identity(identity_from(&ca2));
        pool.client("w1").unwrap();
        let entry = pool.clients.get("w1").unwrap();
        assert_eq!(entry.ca_fingerprint, fingerprint_pem(&ca2.cert_pem).unwrap());
    }

    #[test]
    fn pool_caps_total_clients_by_lru() {
        crate::tls::install_crypto_provider();
        let pool = ConnectionPool::new(Duration::from_secs(10), 2);
        let ca = generate_ca("Mesh CA").unwrap();
        pool.set_identity(identity_from(&ca));

        pool.client("w1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.client("w2").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.client("w3").unwrap();

        assert_eq!(pool.clients.len(), 2);
        assert!(!pool.clients.contains_key("w1"), "oldest client not evicted");
    }

    #[test]
    fn stats_track_failures_per_peer() {
        let pool = ConnectionPool::new(Duration::from_secs(10), 8);
        pool.record_success("w1");
        pool.record_failure("w1");
        let stats = pool.stats();
        assert_eq!(stats["w1"].requests, 2);
        assert_eq!(stats["w1"].failures, 1);
    }
}
