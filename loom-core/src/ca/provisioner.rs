//! Per-node certificate provisioning state machine.
//!
//! CHECK -> SPIN_UP_HTTP_VALIDATOR -> REQUEST_CERT -> AWAIT_CALLBACK ->
//! INSTALL, with exponential backoff (1 s doubling, capped at 60 s)
//! looping back to CHECK on failure. The node refuses to start its TLS
//! listener until INSTALL has succeeded once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ca::certs::{fingerprint_pem, CertificateRecord};
use crate::ca::{random_token, LEAF_RECORD_KEY};
use crate::store::{SecureStore, NS_CERT};
use crate::types::{unix_ms, CertRequest, CertResponse, ChallengeResponse};

pub const CA_TRUST_KEY: &str = "ca-trust";

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The challenge this node is currently serving on its validator.
#[derive(Debug, Clone)]
pub struct LocalChallenge {
    pub token: String,
    pub node_id: String,
    pub created_ms: u64,
}

pub type ChallengeSlot = Arc<Mutex<Option<LocalChallenge>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertCheck {
    Ready,
    NeedsRenewal(String),
}

/// Decide whether the stored leaf is usable as-is.
pub fn check_record(
    record: Option<&CertificateRecord>,
    now_unix: i64,
    leadtime_days: i64,
    current_ip: &str,
    current_hostname: &str,
    trusted_fingerprint: Option<&str>,
) -> CertCheck {
    let Some(record) = record else {
        return CertCheck::NeedsRenewal("no certificate on record".into());
    };
    if record.not_after - now_unix < leadtime_days * 86_400 {
        return CertCheck::NeedsRenewal(format!(
            "expires in {} days",
            record.days_until_expiry(now_unix)
        ));
    }
    if !current_ip.is_empty() && !record.san_ips.iter().any(|ip| ip == current_ip) {
        return CertCheck::NeedsRenewal(format!("address {current_ip} missing from SANs"));
    }
    if !current_hostname.is_empty()
        && !record.san_dns.iter().any(|name| name == current_hostname)
    {
        return CertCheck::NeedsRenewal(format!(
            "hostname {current_hostname} missing from SANs"
        ));
    }
    if let Some(trusted) = trusted_fingerprint {
        if record.issuer_fingerprint != trusted {
            return CertCheck::NeedsRenewal("issuer does not match trusted CA".into());
        }
    }
    CertCheck::Ready
}

pub struct CertProvisioner {
    store: Arc<dyn SecureStore>,
    node_id: String,
    validator_port: u16,
    renewal_leadtime_days: i64,
    /// Plain-HTTP provisioning endpoints on the coordinators
    /// (host:port pairs).
    provisioning_endpoints: Vec<String>,
    challenge_slot: ChallengeSlot,
    http: reqwest::Client,
}

impl CertProvisioner {
    pub fn new(
        store: Arc<dyn SecureStore>,
        node_id: impl Into<String>,
        validator_port: u16,
        renewal_leadtime_days: i64,
        provisioning_endpoints: Vec<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build provisioning client")?;
        Ok(Self {
            store,
            node_id: node_id.into(),
            validator_port,
            renewal_leadtime_days,
            provisioning_endpoints,
            challenge_slot: Arc::new(Mutex::new(None)),
            http,
        })
    }

    pub fn challenge_slot(&self) -> ChallengeSlot {
        self.challenge_slot.clone()
    }

    pub async fn load_record(&self) -> Result<Option<CertificateRecord>> {
        match self.store.read(NS_CERT, LEAF_RECORD_KEY).await? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Corrupt certificate record")?,
            )),
            None => Ok(None),
        }
    }

    pub async fn trusted_ca(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .read(NS_CERT, CA_TRUST_KEY)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    /// Fetch the CA certificate from a coordinator and persist it as the
    /// local trust root.
    async fn refresh_trusted_ca(&self) -> Result<String> {
        let mut last_err = None;
        for endpoint in &self.provisioning_endpoints {
            let url = format!("http://{endpoint}/internal/ca-cert");
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let pem = response.text().await.context("CA cert body")?;
                    fingerprint_pem(&pem).context("Coordinator returned invalid CA PEM")?;
                    self.store
                        .write(NS_CERT, CA_TRUST_KEY, pem.clone().into_bytes())
                        .await?;
                    info!("Fetched CA certificate from {endpoint}");
                    return Ok(pem);
                }
                Ok(response) => {
                    last_err = Some(anyhow::anyhow!(
                        "{endpoint} returned HTTP {}",
                        response.status()
                    ));
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("{endpoint}: {e}"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no provisioning endpoints configured")))
    }

    /// One full provisioning attempt against the coordinators.
    async fn attempt(
        &self,
        ca_pem: &str,
        ip_addresses: &[String],
        dns_names: &[String],
        old_fingerprint: Option<String>,
    ) -> Result<CertificateRecord> {
        // SPIN_UP_HTTP_VALIDATOR
        let token = random_token();
        *self.challenge_slot.lock() = Some(LocalChallenge {
            token: token.clone(),
            node_id: self.node_id.clone(),
            created_ms: unix_ms(),
        });

        let bind: SocketAddr = format!("0.0.0.0:{}", self.validator_port)
            .parse()
            .expect("static bind address");
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind validator on {bind}"))?;
        let router = challenge_router(self.challenge_slot.clone());
        let validator = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        // REQUEST_CERT / AWAIT_CALLBACK: the coordinator performs the
        // challenge fetch synchronously while this POST is in flight.
        let result = self
            .request_from_coordinators(&token, ip_addresses, dns_names, old_fingerprint)
            .await;

        // Tear the validator down regardless of outcome.
        validator.abort();
        *self.challenge_slot.lock() = None;

        let response = result?;

        // INSTALL
        let now = unix_ms() as i64 / 1000;
        let record = CertificateRecord {
            cert_pem: response.certificate,
            key_pem: response.private_key,
            not_before: now,
            not_after: now + response.valid_days * 86_400,
            san_ips: ip_addresses.to_vec(),
            san_dns: dns_names.to_vec(),
            issuer_fingerprint: fingerprint_pem(ca_pem)?,
        };
        self.store
            .write(NS_CERT, LEAF_RECORD_KEY, serde_json::to_vec(&record)?)
            .await?;
        self.store.flush().await?;
        info!(
            "Installed certificate for {} (valid {} days)",
            self.node_id, response.valid_days
        );
        Ok(record)
    }

    async fn request_from_coordinators(
        &self,
        token: &str,
        ip_addresses: &[String],
        dns_names: &[String],
        old_fingerprint: Option<String>,
    ) -> Result<CertResponse> {
        let request = CertRequest {
            node_id: self.node_id.clone(),
            challenge: token.to_string(),
            ip_addresses: ip_addresses.to_vec(),
            dns_names: dns_names.to_vec(),
            old_cert_fingerprint: old_fingerprint,
            validator_port: Some(self.validator_port),
        };

        let mut last_err = None;
        for endpoint in &self.provisioning_endpoints {
            let url = format!("http://{endpoint}/internal/cert-request");
            debug!("Requesting certificate from {url}");
            match self.http.post(&url).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<CertResponse>()
                        .await
                        .context("Malformed certificate response");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "{endpoint} rejected cert request ({status}): {body}"
                    ));
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("{endpoint}: {e}"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no provisioning endpoints configured")))
    }

    /// Run CHECK and, when needed, the full issuance dance with
    /// exponential backoff until a certificate is installed or shutdown
    /// is requested. Returns the usable record plus the trusted CA PEM.
    pub async fn ensure_certificate(
        &self,
        ip_addresses: &[String],
        dns_names: &[String],
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(CertificateRecord, String)> {
        let mut backoff = BACKOFF_START;

        loop {
            let outcome = self
                .try_ensure(ip_addresses, dns_names)
                .await;
            match outcome {
                Ok(done) => return Ok(done),
                Err(e) => {
                    // Never terminal: retry until shutdown.
                    warn!(
                        "Certificate provisioning failed ({e:#}); retrying in {:?}",
                        backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                anyhow::bail!("shutdown during certificate provisioning");
                            }
                        }
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn try_ensure(
        &self,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<(CertificateRecord, String)> {
        let ca_pem = match self.trusted_ca().await? {
            Some(pem) => pem,
            None => self.refresh_trusted_ca().await?,
        };
        let trusted_fp = fingerprint_pem(&ca_pem)?;

        let record = self.load_record().await?;
        let current_ip = ip_addresses.first().map(String::as_str).unwrap_or("");
        let current_hostname = dns_names.first().map(String::as_str).unwrap_or("");
        let check = check_record(
            record.as_ref(),
            unix_ms() as i64 / 1000,
            self.renewal_leadtime_days,
            current_ip,
            current_hostname,
            Some(&trusted_fp),
        );

        match check {
            CertCheck::Ready => Ok((record.expect("checked above"), ca_pem)),
            CertCheck::NeedsRenewal(reason) => {
                info!("Certificate needs (re)provisioning: {reason}");
                // The trust root may have rotated under us; refresh it so
                // the new leaf verifies against what the coordinator
                // actually uses now.
                let ca_pem = match self.refresh_trusted_ca().await {
                    Ok(pem) => pem,
                    Err(e) => {
                        debug!("CA refresh failed, keeping stored trust root: {e:#}");
                        ca_pem
                    }
                };
                let old_fingerprint = record
                    .as_ref()
                    .and_then(|r| fingerprint_pem(&r.cert_pem).ok());
                let record = self
                    .attempt(&ca_pem, ip_addresses, dns_names, old_fingerprint)
                    .await?;
                Ok((record, ca_pem))
            }
        }
    }

}

/// Router serving the challenge path; mounted on the temporary validator
/// listener and on every node's dispatcher.
pub fn challenge_router(slot: ChallengeSlot) -> Router {
    Router::new()
        .route("/internal/cert-challenge/:token", get(serve_challenge))
        .with_state(slot)
}

async fn serve_challenge(
    State(slot): State<ChallengeSlot>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let challenge = slot.lock().clone();
    match challenge {
        None => (StatusCode::NOT_FOUND, "no pending challenge").into_response(),
        Some(challenge) if challenge.token != token => {
            (StatusCode::FORBIDDEN, "challenge token mismatch").into_response()
        }
        Some(challenge) => Json(ChallengeResponse {
            challenge: challenge.token,
            node_id: challenge.node_id,
            timestamp: challenge.created_ms,
        })
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        not_after: i64,
        san_ips: &[&str],
        san_dns: &[&str],
        issuer_fingerprint: &str,
    ) -> CertificateRecord {
        CertificateRecord {
            cert_pem: String::new(),
            key_pem: String::new(),
            not_before: 0,
            not_after,
            san_ips: san_ips.iter().map(|s| s.to_string()).collect(),
            san_dns: san_dns.iter().map(|s| s.to_string()).collect(),
            issuer_fingerprint: issuer_fingerprint.to_string(),
        }
    }

    #[test]
    fn missing_record_needs_provisioning() {
        let check = check_record(None, 0, 30, "10.0.0.2", "host-a", None);
        assert!(matches!(check, CertCheck::NeedsRenewal(_)));
    }

    #[test]
    fn expiry_inside_leadtime_triggers_renewal() {
        let now = 1_700_000_000;
        let thirty_days = 30 * 86_400;

        // Expires in exactly 30 days minus one second: renew.
        let r = record(now + thirty_days - 1, &["10.0.0.2"], &["host-a"], "fp");
        let check = check_record(Some(&r), now, 30, "10.0.0.2", "host-a", Some("fp"));
        assert!(matches!(check, CertCheck::NeedsRenewal(_)));

        // Expires comfortably later: fine.
        let r = record(now + thirty_days + 3600, &["10.0.0.2"], &["host-a"], "fp");
        let check = check_record(Some(&r), now, 30, "10.0.0.2", "host-a", Some("fp"));
        assert_eq!(check, CertCheck::Ready);
    }

    #[test]
    fn address_or_hostname_drift_triggers_renewal() {
        let now = 0;
        let r = record(400 * 86_400, &["10.0.0.2"], &["host-a"], "fp");

        let check = check_record(Some(&r), now, 30, "10.9.9.9", "host-a", Some("fp"));
        assert!(matches!(check, CertCheck::NeedsRenewal(_)));

        let check = check_record(Some(&r), now, 30, "10.0.0.2", "host-b", Some("fp"));
        assert!(matches!(check, CertCheck::NeedsRenewal(_)));
    }

    #[test]
    fn issuer_mismatch_triggers_renewal() {
        let r = record(400 * 86_400, &["10.0.0.2"], &["host-a"], "old-fp");
        let check = check_record(Some(&r), 0, 30, "10.0.0.2", "host-a", Some("new-fp"));
        assert!(matches!(check, CertCheck::NeedsRenewal(_)));
    }

    #[tokio::test]
    async fn challenge_route_distinguishes_missing_and_mismatched() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let slot: ChallengeSlot = Arc::new(Mutex::new(None));
        let router = challenge_router(slot.clone());

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/internal/cert-challenge/abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        *slot.lock() = Some(LocalChallenge {
            token: "righttoken".to_string(),
            node_id: "w1".to_string(),
            created_ms: 1,
        });

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/internal/cert-challenge/wrongtoken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/internal/cert-challenge/righttoken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
