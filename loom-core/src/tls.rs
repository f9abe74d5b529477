use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};

/// Install the process-wide crypto provider. Idempotent; later calls are
/// ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a TLS server configuration from in-memory PEM material.
///
/// If `ca_pem` is provided, enables mTLS (client certificate verification
/// against the cluster CA).
pub fn load_server_config(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: Option<&str>,
) -> Result<ServerConfig> {
    let cert_chain = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;

    let config = if let Some(ca_pem) = ca_pem {
        // mTLS: require a client certificate chained to the cluster CA
        let ca_certs = load_certs(ca_pem)?;
        let mut root_store = rustls::RootCertStore::empty();
        for cert in ca_certs {
            root_store
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .context("Failed to build client certificate verifier")?;

        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .context("Failed to create mTLS server config")?
    } else {
        // Server TLS only (no client auth)
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("Failed to create TLS server config")?
    };

    Ok(config)
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = Cursor::new(pem.as_bytes());
    let certs: Vec<_> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse certificates from PEM data")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    Ok(certs)
}

fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = Cursor::new(pem.as_bytes());
    let key = private_key(&mut reader)
        .context("Failed to parse private key from PEM data")?
        .context("No private key found in PEM data")?;

    Ok(key)
}
