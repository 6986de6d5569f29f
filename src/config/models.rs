//! Gateway configuration.
//!
//! All configuration arrives through environment variables (the gateway is
//! deployed as a twelve-factor process). The raw environment is collected by
//! the loader; this module holds the normalised, validated shape the rest of
//! the crate consumes.

use std::time::Duration;

use eyre::{Result, WrapErr};
use serde::Deserialize;

/// Registry namespace used when `NAMESPACE` is not set.
pub const DEFAULT_NAMESPACE: &str = "services";

/// Normalised gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Registry root directory for service state.
    pub namespace: String,
    /// Deployment environment segment to mirror (`VINE_ENV`, falling back
    /// to `GO_ENV`).
    pub environment: String,
    /// HTTP listener port.
    pub port: u16,
    /// Registry endpoints, e.g. `https://etcd-1:2379`.
    pub etcd_client_peers: Vec<String>,
    pub etcd_username: Option<String>,
    pub etcd_password: Option<String>,
    /// PEM bundle for the registry's CA, inline.
    pub etcd_ca_string: Option<String>,
    /// PEM bundle for the registry's CA, on disk.
    pub etcd_ca_cert_path: Option<String>,
    /// Preserve client-supplied X-Forwarded-* headers instead of
    /// overwriting them.
    pub trust_forward_header: bool,
    /// Seconds between liveness publications.
    pub publish_interval_secs: u64,
    /// Liveness key TTL in seconds.
    pub publish_ttl_secs: u64,
}

impl GatewayConfig {
    /// The CA PEM bundle to trust for registry connections, if configured.
    /// The inline form wins over the file path.
    pub fn registry_ca_pem(&self) -> Result<Option<String>> {
        if let Some(pem) = &self.etcd_ca_string {
            if !pem.is_empty() {
                return Ok(Some(pem.clone()));
            }
        }
        if let Some(path) = &self.etcd_ca_cert_path {
            if !path.is_empty() {
                let pem = std::fs::read_to_string(path).wrap_err_with(|| {
                    format!("failed to read registry CA certificate at {path}")
                })?;
                return Ok(Some(pem));
            }
        }
        Ok(None)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn publish_ttl(&self) -> Duration {
        Duration::from_secs(self.publish_ttl_secs)
    }
}

/// The environment as collected by the `config` crate, before
/// normalisation. Field names follow the lowercased variable names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEnvironment {
    pub namespace: Option<String>,
    pub vine_env: Option<String>,
    pub go_env: Option<String>,
    pub port: Option<String>,
    pub etcd_client_peers: Option<String>,
    pub etcd_username: Option<String>,
    pub etcd_password: Option<String>,
    pub etcd_ca_string: Option<String>,
    pub etcd_ca_cert_path: Option<String>,
    pub trust_forward_header: Option<String>,
    pub publish_interval_secs: Option<String>,
    pub publish_ttl_secs: Option<String>,
}
