//! X.509 generation and inspection helpers for the internal CA.

use std::io::Cursor;
use std::net::IpAddr;

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

const ORG_NAME: &str = "Loom Mesh";
pub const CA_VALID_DAYS: i64 = 3650;
pub const LEAF_VALID_DAYS: i64 = 365;

/// CA certificate and key as stored in the secure store. The stored PEM
/// bytes are authoritative for trust decisions and fingerprinting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A node's leaf certificate plus the metadata the provisioner needs for
/// renewal checks, kept in the "cert" namespace. Old records are
/// overwritten, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub cert_pem: String,
    pub key_pem: String,
    /// Unix seconds.
    pub not_before: i64,
    pub not_after: i64,
    pub san_ips: Vec<String>,
    pub san_dns: Vec<String>,
    pub issuer_fingerprint: String,
}

impl CertificateRecord {
    pub fn days_until_expiry(&self, now_unix: i64) -> i64 {
        (self.not_after - now_unix) / 86_400
    }
}

/// Generate a fresh self-signed CA, valid for ten years.
pub fn generate_ca(common_name: &str) -> Result<CaMaterial> {
    let key_pair = KeyPair::generate().context("Failed to generate CA key pair")?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORG_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALID_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign CA certificate")?;

    Ok(CaMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Issues leaf certificates under a CA loaded from stored PEM material.
pub struct CertSigner {
    issuer: rcgen::Certificate,
    issuer_key: KeyPair,
    ca_cert_pem: String,
    ca_fingerprint: String,
}

impl CertSigner {
    pub fn from_material(material: &CaMaterial) -> Result<Self> {
        let issuer_key =
            KeyPair::from_pem(&material.key_pem).context("Failed to parse CA private key")?;
        // Rebuild issuer params from the stored certificate so issued
        // leaves carry the stored CA's distinguished name.
        let params = CertificateParams::from_ca_cert_pem(&material.cert_pem)
            .context("Failed to parse CA certificate")?;
        let issuer = params
            .self_signed(&issuer_key)
            .context("Failed to reconstruct CA issuer")?;
        let ca_fingerprint = fingerprint_pem(&material.cert_pem)?;

        Ok(Self {
            issuer,
            issuer_key,
            ca_cert_pem: material.cert_pem.clone(),
            ca_fingerprint,
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_fingerprint(&self) -> &str {
        &self.ca_fingerprint
    }

    /// Sign a leaf for a node: CN = node id, SANs deduplicated, one year
    /// validity, server and client auth. The CA key never leaves this
    /// process.
    pub fn issue_leaf(
        &self,
        node_id: &str,
        ip_addresses: &[String],
        dns_names: &[String],
    ) -> Result<CertificateRecord> {
        let key_pair = KeyPair::generate().context("Failed to generate leaf key pair")?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        dn.push(DnType::OrganizationName, ORG_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(LEAF_VALID_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let mut san_ips: Vec<String> = Vec::new();
        let mut san_dns: Vec<String> = Vec::new();
        let mut sans = Vec::new();
        for ip in ip_addresses {
            if san_ips.contains(ip) {
                continue;
            }
            let parsed: IpAddr = ip
                .parse()
                .with_context(|| format!("Invalid SAN IP address: {ip}"))?;
            sans.push(SanType::IpAddress(parsed));
            san_ips.push(ip.clone());
        }
        for name in dns_names {
            if san_dns.contains(name) {
                continue;
            }
            sans.push(SanType::DnsName(
                name.clone()
                    .try_into()
                    .with_context(|| format!("Invalid SAN DNS name: {name}"))?,
            ));
            san_dns.push(name.clone());
        }
        params.subject_alt_names = sans;

        let cert = params
            .signed_by(&key_pair, &self.issuer, &self.issuer_key)
            .context("Failed to sign leaf certificate")?;

        Ok(CertificateRecord {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_before: not_before.unix_timestamp(),
            not_after: not_after.unix_timestamp(),
            san_ips,
            san_dns,
            issuer_fingerprint: self.ca_fingerprint.clone(),
        })
    }
}

/// SHA-256 over the DER encoding of the first certificate in a PEM blob,
/// hex-encoded.
pub fn fingerprint_pem(cert_pem: &str) -> Result<String> {
    let mut reader = Cursor::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .context("No certificate in PEM data")?
        .context("Failed to parse PEM certificate")?;
    let digest = Sha256::digest(der.as_ref());
    Ok(to_hex(&digest))
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
