use eyre::Result;

use crate::config::models::GatewayConfig;

/// Validation result type alias.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration errors that are fatal at startup.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("missing required environment variable: {name}")]
    MissingVariable { name: &'static str },

    #[error("invalid value for {name}: {message}")]
    InvalidVariable { name: &'static str, message: String },
}

/// Gateway configuration validator.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate a normalised configuration.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        if config.environment.is_empty() {
            return Err(ValidationError::MissingVariable { name: "VINE_ENV" });
        }
        if config.port == 0 {
            return Err(ValidationError::InvalidVariable {
                name: "PORT",
                message: "port must be nonzero".to_string(),
            });
        }
        if config.etcd_client_peers.is_empty() {
            return Err(ValidationError::MissingVariable {
                name: "ETCD_CLIENT_PEERS",
            });
        }
        for peer in &config.etcd_client_peers {
            if !peer.starts_with("http://") && !peer.starts_with("https://") {
                return Err(ValidationError::InvalidVariable {
                    name: "ETCD_CLIENT_PEERS",
                    message: format!("endpoint must start with http:// or https://, got: {peer}"),
                });
            }
        }
        if config.publish_ttl_secs <= config.publish_interval_secs {
            return Err(ValidationError::InvalidVariable {
                name: "PUBLISH_TTL_SECS",
                message: "liveness TTL must exceed the publish interval".to_string(),
            });
        }
        Ok(())
    }
}
