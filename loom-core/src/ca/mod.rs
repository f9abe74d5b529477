//! Internal certificate authority: ACME-flavored challenge-response
//! issuance bootstrapping mutual TLS from a cold start.
//!
//! The coordinator owns the CA material ([`CertAuthority`]); every node
//! runs the provisioning state machine ([`provisioner::CertProvisioner`]).

pub mod certs;
pub mod provisioner;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::RngCore;
use tracing::{info, warn};

use crate::store::{SecureStore, NS_CERT};
use crate::types::{unix_ms, CertRequest, CertResponse, ChallengeResponse};
use certs::{generate_ca, to_hex, CaMaterial, CertSigner, CertificateRecord};

pub const CA_MATERIAL_KEY: &str = "ca";
pub const LEAF_RECORD_KEY: &str = "leaf";

const CHALLENGE_TTL_MS: u64 = 60_000;
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// 32 random bytes, hex-encoded. Used for challenge tokens and gossip
/// nonces.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

/// Transient issuance state: one active challenge per requester, a new
/// request preempts any existing one.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub challenge_token: String,
    pub requester_node_id: String,
    pub requester_address: String,
    pub requested_sans: Vec<String>,
    pub expires_at: u64,
}

/// Issuance failures, mapped onto HTTP statuses at the dispatcher.
#[derive(Debug)]
pub enum IssueError {
    /// 400
    BadRequest(String),
    /// 403
    Forbidden(String),
    /// 503
    Unavailable(String),
    /// 500
    Internal(anyhow::Error),
}

pub struct CertAuthority {
    signer: CertSigner,
    store: Arc<dyn SecureStore>,
    pending: DashMap<String, PendingChallenge>,
    http: reqwest::Client,
}

impl CertAuthority {
    /// Load the CA from the secure store, generating and persisting a
    /// fresh self-signed CA (10-year validity) when absent.
    pub async fn bootstrap(store: Arc<dyn SecureStore>) -> Result<Self> {
        let material = match store.read(NS_CERT, CA_MATERIAL_KEY).await? {
            Some(bytes) => {
                let material: CaMaterial =
                    serde_json::from_slice(&bytes).context("Corrupt CA material in store")?;
                info!("Loaded CA certificate from secure store");
                material
            }
            None => {
                info!("No CA found, generating a fresh one");
                let material = generate_ca("Loom Mesh CA")?;
                store
                    .write(
                        NS_CERT,
                        CA_MATERIAL_KEY,
                        serde_json::to_vec(&material)?,
                    )
                    .await?;
                store.flush().await?;
                material
            }
        };

        let signer = CertSigner::from_material(&material)?;
        info!("CA ready, fingerprint {}", signer.ca_fingerprint());

        let http = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .context("Failed to build CA callback client")?;

        Ok(Self {
            signer,
            store,
            pending: DashMap::new(),
            http,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.signer.ca_cert_pem()
    }

    pub fn ca_fingerprint(&self) -> &str {
        self.signer.ca_fingerprint()
    }

    /// Issue the coordinator's own leaf without a challenge round trip.
    pub async fn self_issue(
        &self,
        node_id: &str,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<CertificateRecord> {
        let record = self.signer.issue_leaf(node_id, ip_addresses, dns_names)?;
        self.store
            .write(NS_CERT, LEAF_RECORD_KEY, serde_json::to_vec(&record)?)
            .await?;
        Ok(record)
    }

    /// Handle a worker's certificate request: validate control of the
    /// claimed address via the HTTP challenge callback, then sign.
    ///
    /// `peer_ip` is the observed source address of the request; the
    /// callback goes there, not to any address claimed in the body.
    pub async fn handle_cert_request(
        &self,
        request: CertRequest,
        peer_ip: IpAddr,
        validator_port: u16,
    ) -> std::result::Result<CertResponse, IssueError> {
        if request.node_id.trim().is_empty() {
            return Err(IssueError::BadRequest("node_id must not be empty".into()));
        }
        if request.challenge.len() != 64 {
            return Err(IssueError::BadRequest(
                "challenge must be 32 hex-encoded bytes".into(),
            ));
        }

        let mut requested_sans = request.ip_addresses.clone();
        requested_sans.extend(request.dns_names.iter().cloned());

        // A new request preempts any existing challenge for this node.
        self.pending.insert(
            request.node_id.clone(),
            PendingChallenge {
                challenge_token: request.challenge.clone(),
                requester_node_id: request.node_id.clone(),
                requester_address: peer_ip.to_string(),
                requested_sans,
                expires_at: unix_ms() + CHALLENGE_TTL_MS,
            },
        );

        let callback_host = match peer_ip {
            IpAddr::V6(v6) => format!("[{v6}]"),
            IpAddr::V4(v4) => v4.to_string(),
        };
        let url = format!(
            "http://{callback_host}:{validator_port}/internal/cert-challenge/{}",
            request.challenge
        );
        info!(
            "Validating cert request from {} via {}",
            request.node_id, url
        );

        let response = self.http.get(&url).send().await.map_err(|e| {
            self.pending.remove(&request.node_id);
            IssueError::Unavailable(format!("challenge callback failed: {e}"))
        })?;

        if !response.status().is_success() {
            self.pending.remove(&request.node_id);
            return Err(IssueError::Forbidden(format!(
                "challenge callback returned HTTP {}",
                response.status()
            )));
        }

        let observed: ChallengeResponse = response.json().await.map_err(|e| {
            self.pending.remove(&request.node_id);
            IssueError::Unavailable(format!("malformed challenge response: {e}"))
        })?;

        let pending = self
            .pending
            .remove(&request.node_id)
            .map(|(_, pending)| pending)
            .ok_or_else(|| IssueError::Forbidden("challenge no longer pending".into()))?;

        if unix_ms() > pending.expires_at {
            return Err(IssueError::Forbidden("challenge expired".into()));
        }
        if observed.challenge != pending.challenge_token
            || observed.node_id != pending.requester_node_id
        {
            warn!(
                "Challenge mismatch for {}: refusing issuance",
                request.node_id
            );
            return Err(IssueError::Forbidden("challenge mismatch".into()));
        }

        if let Some(old) = &request.old_cert_fingerprint {
            // Informational only; not a revocation trigger.
            info!("Renewal for {} replacing cert {}", request.node_id, old);
        }

        let record = self
            .signer
            .issue_leaf(
                &request.node_id,
                &request.ip_addresses,
                &request.dns_names,
            )
            .map_err(IssueError::Internal)?;

        info!(
            "Issued certificate for {} ({} IP SANs, {} DNS SANs, {} days)",
            request.node_id,
            record.san_ips.len(),
            record.san_dns.len(),
            certs::LEAF_VALID_DAYS
        );

        Ok(CertResponse {
            certificate: record.cert_pem,
            private_key: record.key_pem,
            node_id: request.node_id,
            valid_days: certs::LEAF_VALID_DAYS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[tokio::test]
    async fn bootstrap_persists_and_reloads_the_same_ca() {
        let store = MemStore::new();
        let first = CertAuthority::bootstrap(store.clone()).await.unwrap();
        let fingerprint = first.ca_fingerprint().to_string();
        drop(first);

        let second = CertAuthority::bootstrap(store).await.unwrap();
        assert_eq!(second.ca_fingerprint(), fingerprint);
    }

    #[tokio::test]
    async fn self_issue_chains_to_the_stored_ca() {
        let store = MemStore::new();
        let ca = CertAuthority::bootstrap(store.clone()).await.unwrap();
        let record = ca
            .self_issue("c1", &["127.0.0.1".to_string()], &["localhost".to_string()])
            .await
            .unwrap();

        assert_eq!(record.issuer_fingerprint, ca.ca_fingerprint());
        // The record landed in the store.
        let stored = store.read(NS_CERT, LEAF_RECORD_KEY).await.unwrap().unwrap();
        let stored: CertificateRecord = serde_json::from_slice(&stored).unwrap();
        assert_eq!(stored.issuer_fingerprint, ca.ca_fingerprint());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected_up_front() {
        let ca = CertAuthority::bootstrap(MemStore::new()).await.unwrap();
        let request = CertRequest {
            node_id: "".to_string(),
            challenge: random_token(),
            ip_addresses: vec![],
            dns_names: vec![],
            old_cert_fingerprint: None,
            validator_port: None,
        };
        let err = ca
            .handle_cert_request(request, "127.0.0.1".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::BadRequest(_)));

        let request = CertRequest {
            node_id: "w1".to_string(),
            challenge: "short".to_string(),
            ip_addresses: vec![],
            dns_names: vec![],
            old_cert_fingerprint: None,
            validator_port: None,
        };
        let err = ca
            .handle_cert_request(request, "127.0.0.1".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::BadRequest(_)));
    }

    #[tokio::test]
    async fn unreachable_validator_yields_unavailable() {
        let ca = CertAuthority::bootstrap(MemStore::new()).await.unwrap();
        let request = CertRequest {
            node_id: "w1".to_string(),
            challenge: random_token(),
            ip_addresses: vec!["127.0.0.1".to_string()],
            dns_names: vec![],
            old_cert_fingerprint: None,
            validator_port: None,
        };
        // Nothing is listening on this port.
        let err = ca
            .handle_cert_request(request, "127.0.0.1".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::Unavailable(_)));
    }
}
