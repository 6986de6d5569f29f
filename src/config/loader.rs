use config::{Config, Environment};
use eyre::{Context, Result};

use crate::config::{
    models::{DEFAULT_NAMESPACE, GatewayConfig, RawEnvironment},
    validation::{GatewayConfigValidator, ValidationError},
};

/// Load, normalise and validate the gateway configuration from the process
/// environment. Any missing required variable is fatal here.
pub fn load_from_env() -> Result<GatewayConfig> {
    let settings = Config::builder()
        .add_source(Environment::default())
        .build()
        .context("failed to read process environment")?;

    let raw: RawEnvironment = settings
        .try_deserialize()
        .context("failed to collect environment variables")?;

    let config = normalize(raw)?;
    GatewayConfigValidator::validate(&config)?;

    if config.etcd_username.is_none() {
        tracing::warn!("ETCD_USERNAME not set, connecting to the registry unauthenticated");
    }
    if config.etcd_ca_string.is_none() && config.etcd_ca_cert_path.is_none() {
        tracing::warn!("no registry CA configured, relying on platform trust roots");
    }

    Ok(config)
}

/// Turn the raw environment into a [`GatewayConfig`], applying defaults and
/// the `VINE_ENV` over `GO_ENV` precedence.
pub(crate) fn normalize(raw: RawEnvironment) -> Result<GatewayConfig, ValidationError> {
    let environment = non_empty(raw.vine_env)
        .or_else(|| non_empty(raw.go_env))
        .ok_or(ValidationError::MissingVariable { name: "VINE_ENV" })?;

    let port = non_empty(raw.port)
        .ok_or(ValidationError::MissingVariable { name: "PORT" })?
        .parse::<u16>()
        .map_err(|error| ValidationError::InvalidVariable {
            name: "PORT",
            message: error.to_string(),
        })?;

    let etcd_client_peers: Vec<String> = non_empty(raw.etcd_client_peers)
        .ok_or(ValidationError::MissingVariable {
            name: "ETCD_CLIENT_PEERS",
        })?
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(str::to_string)
        .collect();

    let publish_interval_secs = parse_seconds(raw.publish_interval_secs, 30, "PUBLISH_INTERVAL_SECS")?;
    let publish_ttl_secs = parse_seconds(raw.publish_ttl_secs, 60, "PUBLISH_TTL_SECS")?;

    Ok(GatewayConfig {
        namespace: non_empty(raw.namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        environment,
        port,
        etcd_client_peers,
        etcd_username: non_empty(raw.etcd_username),
        etcd_password: non_empty(raw.etcd_password),
        etcd_ca_string: non_empty(raw.etcd_ca_string),
        etcd_ca_cert_path: non_empty(raw.etcd_ca_cert_path),
        trust_forward_header: matches!(
            raw.trust_forward_header.as_deref(),
            Some("1") | Some("true") | Some("TRUE")
        ),
        publish_interval_secs,
        publish_ttl_secs,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_seconds(
    value: Option<String>,
    default: u64,
    name: &'static str,
) -> Result<u64, ValidationError> {
    match non_empty(value) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|error: std::num::ParseIntError| {
            ValidationError::InvalidVariable {
                name,
                message: error.to_string(),
            }
        }),
    }
}
