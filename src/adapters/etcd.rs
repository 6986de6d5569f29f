//! etcd v2 keys API adapter for the registry port.
//!
//! Talks plain HTTP(S) to the cluster: reads are `GET /v2/keys/<key>`,
//! writes are form-encoded `PUT`s, and watching is a recursive long-poll
//! with `wait=true`. Endpoints are tried in order until one answers. TLS
//! trust comes from the configured CA bundle on top of the platform roots.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;

use crate::{
    config::GatewayConfig,
    ports::registry::{
        Registry, RegistryError, RegistryEvent, RegistryResponse, RegistryResult, RegistryWatcher,
        SetOptions,
    },
};

/// Header carrying the cluster's current index on every response.
const INDEX_HEADER: &str = "X-Etcd-Index";

/// etcd error code for a missing key.
const CODE_KEY_NOT_FOUND: u64 = 100;
/// etcd error code for a watch index that has been compacted away.
const CODE_EVENT_INDEX_CLEARED: u64 = 401;

/// Deadline for point reads and writes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How long one watch long-poll is allowed to hang before re-arming.
const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(55);

/// Error document returned by the keys API.
#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

/// Registry adapter over the etcd v2 HTTP keys API.
pub struct EtcdRegistry {
    client: Client,
    endpoints: Vec<String>,
    username: Option<String>,
    password: Option<String>,
}

impl EtcdRegistry {
    /// Build a client from the gateway configuration, installing the
    /// registry CA bundle when one is configured.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(pem) = config.registry_ca_pem()? {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .context("invalid registry CA certificate")?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .context("failed to build registry HTTP client")?;

        Ok(Self {
            client,
            endpoints: config.etcd_client_peers.clone(),
            username: config.etcd_username.clone(),
            password: config.etcd_password.clone(),
        })
    }

    fn request(&self, method: Method, endpoint: &str, key: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/v2/keys{}", endpoint.trim_end_matches('/'), key);
        let mut request = self.client.request(method, url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    /// Send one request and decode the keys-API response envelope.
    async fn execute(request: reqwest::RequestBuilder) -> RegistryResult<(RegistryEvent, u64)> {
        let response = request.send().await.map_err(classify_transport)?;
        let cluster_index = header_index(&response);
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        let mut event: RegistryEvent = serde_json::from_str(&body)?;
        event.index = event
            .node
            .as_ref()
            .map(|node| node.modified_index)
            .filter(|index| *index > 0)
            .unwrap_or(cluster_index);
        let index = event.index;
        Ok((event, index))
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get(&self, key: &str, recursive: bool) -> RegistryResult<RegistryResponse> {
        let mut last_error = RegistryError::Cluster("no registry endpoints configured".to_string());
        for endpoint in &self.endpoints {
            let mut request = self
                .request(Method::GET, endpoint, key)
                .timeout(REQUEST_TIMEOUT);
            if recursive {
                request = request.query(&[("recursive", "true")]);
            }

            match Self::execute(request).await {
                Ok((event, index)) => {
                    let node = event.node.ok_or_else(|| {
                        RegistryError::Cluster("registry response carried no node".to_string())
                    })?;
                    return Ok(RegistryResponse { node, index });
                }
                // The cluster answered; a missing key is authoritative.
                Err(error @ RegistryError::KeyNotFound(_)) => return Err(error),
                Err(error) => {
                    tracing::debug!(endpoint, %error, "registry endpoint failed, trying next");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> RegistryResult<RegistryResponse> {
        let mut form: Vec<(&str, String)> = Vec::new();
        // A refresh keeps the stored value; sending one is rejected.
        if options.refresh {
            form.push(("refresh", "true".to_string()));
        } else {
            form.push(("value", value.to_string()));
        }
        if let Some(ttl) = options.ttl {
            form.push(("ttl", ttl.as_secs().to_string()));
        }
        if let Some(prev_exist) = options.prev_exist {
            form.push(("prevExist", prev_exist.to_string()));
        }

        let mut last_error = RegistryError::Cluster("no registry endpoints configured".to_string());
        for endpoint in &self.endpoints {
            let request = self
                .request(Method::PUT, endpoint, key)
                .timeout(REQUEST_TIMEOUT)
                .form(&form);

            match Self::execute(request).await {
                Ok((event, index)) => {
                    let node = event.node.ok_or_else(|| {
                        RegistryError::Cluster("registry response carried no node".to_string())
                    })?;
                    return Ok(RegistryResponse { node, index });
                }
                Err(error @ RegistryError::KeyNotFound(_)) => return Err(error),
                Err(error) => {
                    tracing::debug!(endpoint, %error, "registry endpoint failed, trying next");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn watch(&self, key: &str, after_index: u64) -> RegistryResult<Box<dyn RegistryWatcher>> {
        Ok(Box::new(EtcdWatcher {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            key: key.to_string(),
            next_index: after_index,
            cursor: 0,
        }))
    }
}

/// One recursive long-poll watch over a subtree. Tracks its own resume
/// index so a compacted history or endpoint change never loses position
/// beyond skipping to the cluster's current index.
struct EtcdWatcher {
    client: Client,
    endpoints: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    key: String,
    /// Next index to wait for; 0 watches from "now".
    next_index: u64,
    /// Rotates through endpoints on transport failures.
    cursor: usize,
}

#[async_trait]
impl RegistryWatcher for EtcdWatcher {
    async fn next(&mut self) -> RegistryResult<RegistryEvent> {
        loop {
            let endpoint = &self.endpoints[self.cursor % self.endpoints.len()];
            let url = format!("{}/v2/keys{}", endpoint.trim_end_matches('/'), self.key);

            let mut request = self
                .client
                .get(url)
                .query(&[("wait", "true"), ("recursive", "true")])
                .timeout(WATCH_POLL_TIMEOUT);
            if self.next_index > 0 {
                request = request.query(&[("waitIndex", self.next_index.to_string())]);
            }
            if let Some(username) = &self.username {
                request = request.basic_auth(username, self.password.as_deref());
            }

            let response = match request.send().await {
                Ok(response) => response,
                // An idle subtree simply outlives the poll; re-arm.
                Err(error) if error.is_timeout() => continue,
                Err(error) => {
                    self.cursor += 1;
                    return Err(classify_transport(error));
                }
            };

            let cluster_index = header_index(&response);
            let status = response.status();
            let body = response.text().await.map_err(classify_transport)?;

            if !status.is_success() {
                if let Ok(wire) = serde_json::from_str::<WireError>(&body) {
                    if wire.error_code == CODE_EVENT_INDEX_CLEARED {
                        // Our resume point was compacted away; skip forward
                        // to the cluster's current index.
                        tracing::warn!(
                            key = %self.key,
                            stale = self.next_index,
                            current = wire.index,
                            "watch index outdated, resuming from cluster index"
                        );
                        self.next_index = wire.index + 1;
                        continue;
                    }
                }
                return Err(classify_failure(status, &body));
            }

            let mut event: RegistryEvent = serde_json::from_str(&body)?;
            let modified = event
                .node
                .as_ref()
                .or(event.prev_node.as_ref())
                .map(|node| node.modified_index)
                .unwrap_or(0);
            if modified > 0 {
                self.next_index = modified + 1;
            }
            event.index = if modified > 0 { modified } else { cluster_index };
            return Ok(event);
        }
    }
}

fn header_index(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn classify_transport(error: reqwest::Error) -> RegistryError {
    if error.is_timeout() {
        RegistryError::Timeout(error.to_string())
    } else {
        RegistryError::Transport(error.to_string())
    }
}

fn classify_failure(status: StatusCode, body: &str) -> RegistryError {
    if let Ok(wire) = serde_json::from_str::<WireError>(body) {
        match wire.error_code {
            CODE_KEY_NOT_FOUND => RegistryError::KeyNotFound(wire.cause),
            _ => RegistryError::Cluster(format!("{} ({})", wire.message, wire.error_code)),
        }
    } else {
        RegistryError::Cluster(format!("{status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_errors_carry_the_key() {
        let body = r#"{"errorCode":100,"message":"Key not found","cause":"/services","index":42}"#;
        match classify_failure(StatusCode::NOT_FOUND, body) {
            RegistryError::KeyNotFound(key) => assert_eq!(key, "/services"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn other_wire_errors_are_cluster_errors() {
        let body = r#"{"errorCode":300,"message":"Raft Internal Error","cause":"","index":0}"#;
        assert!(matches!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, body),
            RegistryError::Cluster(_)
        ));
    }

    #[test]
    fn unparseable_failures_keep_the_status() {
        let error = classify_failure(StatusCode::BAD_GATEWAY, "upstream burped");
        match error {
            RegistryError::Cluster(message) => {
                assert!(message.contains("502"));
                assert!(message.contains("upstream burped"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn watch_events_decode_from_wire_json() {
        let body = r#"{
            "action": "set",
            "node": {"key": "/services/users/production/hosts/m1", "value": "10.0.0.1:8080", "modifiedIndex": 7, "createdIndex": 7},
            "prevNode": {"key": "/services/users/production/hosts/m1", "value": "10.0.0.9:8080", "modifiedIndex": 3, "createdIndex": 3}
        }"#;
        let event: RegistryEvent = serde_json::from_str(body).unwrap();
        assert!(event.action.is_upsert());
        assert_eq!(event.node.unwrap().value.as_deref(), Some("10.0.0.1:8080"));
        assert_eq!(event.prev_node.unwrap().modified_index, 3);
    }
}
