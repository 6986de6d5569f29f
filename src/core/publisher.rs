//! Gateway liveness publisher.
//!
//! Peer services discover running gateways through a TTL'd key under
//! `/gateway/environments/<env>/<hostname>`. The publisher refreshes that
//! key on a fixed cadence; if the gateway dies, the key expires and peers
//! stop routing to it.

use std::{sync::Arc, time::Duration};

use crate::{
    core::keys,
    ports::registry::{Registry, RegistryError, RegistryResult, SetOptions},
    utils::net,
};

/// How often the liveness key is rewritten.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
/// How long the liveness key survives without a refresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Periodically advertises this gateway's address in the registry.
pub struct LivenessPublisher {
    registry: Arc<dyn Registry>,
    key: String,
    address: String,
    interval: Duration,
    ttl: Duration,
}

impl LivenessPublisher {
    /// Build a publisher advertising `<primary-ipv4>:<port>` for the given
    /// environment. Hostnames containing `.local` advertise loopback
    /// instead, since developer machines have no routable address worth
    /// publishing.
    pub fn new(registry: Arc<dyn Registry>, environment: &str, port: u16) -> Self {
        Self::with_timing(registry, environment, port, DEFAULT_INTERVAL, DEFAULT_TTL)
    }

    pub fn with_timing(
        registry: Arc<dyn Registry>,
        environment: &str,
        port: u16,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        let hostname = net::hostname();
        let ip = if hostname.contains(".local") {
            "127.0.0.1".to_string()
        } else {
            net::primary_ipv4()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string())
        };
        Self {
            registry,
            key: keys::liveness_key(environment, &hostname),
            address: format!("{ip}:{port}"),
            interval,
            ttl,
        }
    }

    /// Write the liveness key once. An existing key has its TTL refreshed
    /// without notifying watchers; the first publication creates it.
    pub async fn publish_once(&self) -> RegistryResult<()> {
        let refresh = SetOptions {
            ttl: Some(self.ttl),
            refresh: true,
            prev_exist: Some(true),
        };
        match self.registry.set(&self.key, &self.address, refresh).await {
            Ok(_) => Ok(()),
            Err(RegistryError::KeyNotFound(_)) => {
                let create = SetOptions {
                    ttl: Some(self.ttl),
                    refresh: false,
                    prev_exist: None,
                };
                self.registry
                    .set(&self.key, &self.address, create)
                    .await
                    .map(|_| ())
            }
            Err(error) => Err(error),
        }
    }

    /// Refresh the liveness key forever. Failures are logged and the next
    /// tick tries again.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(key = %self.key, address = %self.address, "publishing gateway liveness");
        loop {
            tokio::time::sleep(self.interval).await;
            match self.publish_once().await {
                Ok(()) => {
                    tracing::info!(key = %self.key, address = %self.address, "gateway liveness refreshed");
                }
                Err(error) => {
                    tracing::error!(key = %self.key, %error, "gateway liveness refresh failed");
                }
            }
        }
    }

    /// The registry key this publisher maintains.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The advertised `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }
}
