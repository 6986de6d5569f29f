//! Backend service instance records.
//!
//! A `routes` document in the registry is a JSON array of `{method, path}`
//! entries exported by the service's framework. Paths may carry a
//! `(.:format)` suffix, which is stripped at parse time. Patterns are kept
//! unprefixed here; the `/api` mount prefix is applied when the record is
//! registered with the routing table.

use std::collections::HashMap;

use serde::Deserialize;

/// Suffix appended by framework route exporters, dropped on ingestion.
const FORMAT_SUFFIX: &str = "(.:format)";

/// Routes maps HTTP methods to URL patterns, preserving document order
/// within each method.
pub type Routes = HashMap<String, Vec<String>>;

/// One entry of a service's `routes` document.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryRoute {
    pub method: String,
    pub path: String,
}

/// A backend service instance mirrored from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Opaque instance identifier (the machine suffix of the hosts key).
    pub id: String,
    /// Service name (the registry key segment).
    pub name: String,
    /// `host:port` of this instance.
    pub address: String,
    /// Method to patterns, after suffix normalisation.
    pub routes: Routes,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>,
        routes: Routes) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            routes,
        }
    }

    /// Iterate all `(method, pattern)` pairs exposed by this record.
    pub fn patterns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().flat_map(|(method, patterns)| {
            patterns
                .iter()
                .map(move |pattern| (method.as_str(), pattern.as_str()))
        })
    }
}

/// Parse a raw `routes` JSON document into a method-to-patterns map,
/// stripping the `(.:format)` suffix from every path.
pub fn parse_routes(document: &str) -> serde_json::Result<Routes> {
    let entries: Vec<RegistryRoute> = serde_json::from_str(document)?;
    let mut routes = Routes::new();
    for entry in entries {
        routes
            .entry(entry.method)
            .or_default()
            .push(entry.path.replace(FORMAT_SUFFIX, ""));
    }
    Ok(routes)
}
