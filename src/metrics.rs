//! Lightweight metrics helpers for Portico.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded;
//! the application can install any compatible recorder externally.
//!
//! Provided metrics:
//! * `portico_requests_total` (counter, labels: method, status)
//! * `portico_backend_requests_total` (counter, label: backend)
//! * `portico_registry_events_total` (counter, label: action)
//! * `portico_mounted_handlers` (gauge)

use metrics::{Unit, counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::Lazy;

use crate::ports::registry::RegistryAction;

pub const PORTICO_REQUESTS_TOTAL: &str = "portico_requests_total";
pub const PORTICO_BACKEND_REQUESTS_TOTAL: &str = "portico_backend_requests_total";
pub const PORTICO_REGISTRY_EVENTS_TOTAL: &str = "portico_registry_events_total";
pub const PORTICO_MOUNTED_HANDLERS: &str = "portico_mounted_handlers";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        PORTICO_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests handled by the gateway."
    );
    describe_counter!(
        PORTICO_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to backend services."
    );
    describe_counter!(
        PORTICO_REGISTRY_EVENTS_TOTAL,
        Unit::Count,
        "Total number of registry watch events applied."
    );
    describe_gauge!(
        PORTICO_MOUNTED_HANDLERS,
        "Number of (method, pattern) handlers currently mounted."
    );
});

/// Count one inbound request and its response status.
pub fn increment_request(method: &str, status: u16) {
    Lazy::force(&DESCRIPTIONS);
    counter!(
        PORTICO_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Count one request forwarded to a backend.
pub fn increment_backend_request(backend: &str) {
    Lazy::force(&DESCRIPTIONS);
    counter!(PORTICO_BACKEND_REQUESTS_TOTAL, "backend" => backend.to_string()).increment(1);
}

/// Count one applied registry event by action.
pub fn increment_registry_event(action: RegistryAction) {
    Lazy::force(&DESCRIPTIONS);
    counter!(PORTICO_REGISTRY_EVENTS_TOTAL, "action" => action.as_str()).increment(1);
}

/// Record the current size of the routing table.
pub fn set_mounted_handlers(count: usize) {
    Lazy::force(&DESCRIPTIONS);
    gauge!(PORTICO_MOUNTED_HANDLERS).set(count as f64);
}
