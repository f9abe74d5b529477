use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::Role;

/// Node configuration, loaded from a TOML file with per-field defaults.
///
/// Only `node_id` and `role` are required; workers additionally need at
/// least one bootstrap coordinator address.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node_id: String,
    pub role: Role,

    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// host:port pairs of coordinator RPC listeners. Required on workers.
    #[serde(default)]
    pub bootstrap_coordinators: Vec<String>,

    /// host:port pairs of the coordinators' plain-HTTP provisioning
    /// listeners. Defaults to the bootstrap hosts on the well-known
    /// validator port.
    #[serde(default)]
    pub bootstrap_provisioning: Vec<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_gossip_interval_min")]
    pub gossip_interval_min_seconds: u64,
    #[serde(default = "default_gossip_interval_max")]
    pub gossip_interval_max_seconds: u64,
    #[serde(default = "default_gossip_max_targets")]
    pub gossip_max_targets: usize,
    #[serde(default = "default_gossip_compression_threshold")]
    pub gossip_compression_threshold_bytes: usize,

    #[serde(default = "default_suspect_timeout")]
    pub suspect_timeout_seconds: u64,
    #[serde(default = "default_dead_timeout")]
    pub dead_timeout_seconds: u64,
    #[serde(default = "default_evict_timeout")]
    pub evict_timeout_seconds: u64,

    #[serde(default = "default_rate_limit_rpc_per_min")]
    pub rate_limit_rpc_per_min: u32,
    #[serde(default = "default_rate_limit_rpc_burst")]
    pub rate_limit_rpc_burst: u32,
    #[serde(default = "default_rate_limit_health_per_min")]
    pub rate_limit_health_per_min: u32,
    #[serde(default = "default_rate_limit_health_burst")]
    pub rate_limit_health_burst: u32,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_cert_validator_port")]
    pub cert_validator_http_port: u16,
    #[serde(default = "default_cert_renewal_leadtime")]
    pub cert_renewal_leadtime_days: i64,

    #[serde(default = "default_outbound_deadline")]
    pub outbound_request_deadline_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// "mtls" requires a client certificate chained to the cluster CA;
    /// "bearer" checks `cluster_token` instead (pre-provisioning mode).
    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub cluster_token: Option<String>,

    /// Secure store database path. Relative paths resolve against the
    /// working directory.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Mtls,
    Bearer,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_listen_port() -> u16 {
    8801
}
fn default_gossip_interval_min() -> u64 {
    5
}
fn default_gossip_interval_max() -> u64 {
    30
}
fn default_gossip_max_targets() -> usize {
    5
}
fn default_gossip_compression_threshold() -> usize {
    1024
}
fn default_suspect_timeout() -> u64 {
    30
}
fn default_dead_timeout() -> u64 {
    90
}
fn default_evict_timeout() -> u64 {
    600
}
fn default_rate_limit_rpc_per_min() -> u32 {
    100
}
fn default_rate_limit_rpc_burst() -> u32 {
    20
}
fn default_rate_limit_health_per_min() -> u32 {
    300
}
fn default_rate_limit_health_burst() -> u32 {
    50
}
fn default_true() -> bool {
    true
}
fn default_cert_validator_port() -> u16 {
    8802
}
fn default_cert_renewal_leadtime() -> i64 {
    30
}
fn default_outbound_deadline() -> u64 {
    10
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_auth_mode() -> AuthMode {
    AuthMode::Mtls
}
fn default_store_path() -> PathBuf {
    PathBuf::from("data/loom-store.db")
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Minimal programmatic configuration, used by tests and embedders.
    pub fn for_node(node_id: impl Into<String>, role: Role) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            bootstrap_coordinators: Vec::new(),
            bootstrap_provisioning: Vec::new(),
            capabilities: Vec::new(),
            gossip_interval_min_seconds: default_gossip_interval_min(),
            gossip_interval_max_seconds: default_gossip_interval_max(),
            gossip_max_targets: default_gossip_max_targets(),
            gossip_compression_threshold_bytes: default_gossip_compression_threshold(),
            suspect_timeout_seconds: default_suspect_timeout(),
            dead_timeout_seconds: default_dead_timeout(),
            evict_timeout_seconds: default_evict_timeout(),
            rate_limit_rpc_per_min: default_rate_limit_rpc_per_min(),
            rate_limit_rpc_burst: default_rate_limit_rpc_burst(),
            rate_limit_health_per_min: default_rate_limit_health_per_min(),
            rate_limit_health_burst: default_rate_limit_health_burst(),
            rate_limit_enabled: true,
            cert_validator_http_port: default_cert_validator_port(),
            cert_renewal_leadtime_days: default_cert_renewal_leadtime(),
            outbound_request_deadline_seconds: default_outbound_deadline(),
            shutdown_grace_seconds: default_shutdown_grace(),
            auth_mode: AuthMode::Mtls,
            cluster_token: None,
            store_path: default_store_path(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.role == Role::Worker && self.bootstrap_coordinators.is_empty() {
            anyhow::bail!("workers require at least one bootstrap_coordinators entry");
        }
        if self.gossip_interval_min_seconds == 0
            || self.gossip_interval_max_seconds < self.gossip_interval_min_seconds
        {
            anyhow::bail!(
                "gossip interval range is invalid: {}..{}",
                self.gossip_interval_min_seconds,
                self.gossip_interval_max_seconds
            );
        }
        if self.auth_mode == AuthMode::Bearer && self.cluster_token.is_none() {
            anyhow::bail!("auth_mode = \"bearer\" requires cluster_token");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_coordinator_config() {
        let config: Config = toml::from_str(
            r#"
            node_id = "c1"
            role = "coordinator"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen_port, 8801);
        assert_eq!(config.gossip_interval_min_seconds, 5);
        assert_eq!(config.gossip_interval_max_seconds, 30);
        assert_eq!(config.dead_timeout_seconds, 90);
        assert!(config.rate_limit_enabled);
    }

    #[test]
    fn worker_without_bootstrap_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            node_id = "w1"
            role = "worker"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bearer_mode_requires_token() {
        let config: Config = toml::from_str(
            r#"
            node_id = "c1"
            role = "coordinator"
            auth_mode = "bearer"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str(
            r#"
            node_id = "c1"
            role = "coordinator"
            auth_mode = "bearer"
            cluster_token = "s3cret"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
    }
}
