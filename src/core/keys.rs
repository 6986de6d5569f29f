//! Registry key schema.
//!
//! Service state lives under a namespace root:
//!
//! ```text
//! /<namespace>/<service>/<environment>/routes            JSON route document
//! /<namespace>/<service>/<environment>/hosts/<instance>  "host:port"
//! ```
//!
//! The gateway itself writes under `/gateway/`:
//!
//! ```text
//! /gateway/environments/<environment>/<hostname>                   liveness
//! /gateway/conflicts/<service>/<environment><pattern>              conflict
//! /gateway/conflicts/duplicates/<service>/<environment><pattern>   duplicate
//! ```

/// A registry key classified against the service schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    /// `/<ns>/<service>/<env>/routes`
    Routes { service: String, environment: String },
    /// `/<ns>/<service>/<env>/hosts/<instance>`
    Host {
        service: String,
        environment: String,
        instance: String,
    },
    /// Anything else (namespace roots, directories, foreign keys).
    Other,
}

/// Classify a key against the service schema. Keys that do not fit the
/// layout parse as [`ParsedKey::Other`] rather than erroring; the watch
/// stream carries plenty of keys the gateway does not care about.
pub fn parse(key: &str) -> ParsedKey {
    let segments: Vec<&str> = key.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        [_ns, service, environment, "routes"] => ParsedKey::Routes {
            service: (*service).to_string(),
            environment: (*environment).to_string(),
        },
        [_ns, service, environment, "hosts", instance] => ParsedKey::Host {
            service: (*service).to_string(),
            environment: (*environment).to_string(),
            instance: (*instance).to_string(),
        },
        _ => ParsedKey::Other,
    }
}

/// Root of a service's per-environment subtree.
pub fn environment_root(namespace: &str, service: &str, environment: &str) -> String {
    format!("/{namespace}/{service}/{environment}")
}

/// The `routes` document key for a service environment.
pub fn routes_key(namespace: &str, service: &str, environment: &str) -> String {
    format!("/{namespace}/{service}/{environment}/routes")
}

/// The `hosts` directory for a service environment.
pub fn hosts_dir(namespace: &str, service: &str, environment: &str) -> String {
    format!("/{namespace}/{service}/{environment}/hosts")
}

/// The gateway's own liveness key.
pub fn liveness_key(environment: &str, hostname: &str) -> String {
    format!("/gateway/environments/{environment}/{hostname}")
}

/// Informational record written when a pattern is offered by an additional
/// address. `pattern` carries its own leading slash.
pub fn conflict_key(service: &str, environment: &str, pattern: &str) -> String {
    format!("/gateway/conflicts/{service}/{environment}{pattern}")
}

/// Informational record written when the same address is re-offered for a
/// pattern it already serves.
pub fn duplicate_key(service: &str, environment: &str, pattern: &str) -> String {
    format!("/gateway/conflicts/duplicates/{service}/{environment}{pattern}")
}
