//! Concurrent routing table.
//!
//! The `Mux` maps `(method, pattern)` to the set of backend addresses
//! currently serving that pattern. Request handling takes the read lock and
//! scans the method's handlers in registration order; the watch loop takes
//! the write lock for mutations. The lock is never held across I/O, and
//! mutation outcomes that warrant side effects (conflict records) are
//! reported back to the caller instead of being performed under the lock.

use std::{collections::HashMap, sync::RwLock};

use crate::core::pattern;

/// The mount prefix applied to every registered pattern. Only request paths
/// beginning with this prefix can match.
pub const MOUNT_PREFIX: &str = "/api";

/// A live routing table entry: one URL pattern and the distinct backend
/// addresses serving it, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHandler {
    pub pattern: String,
    pub addresses: Vec<String>,
}

impl PatternHandler {
    /// Returns true when this handler's pattern matches the path.
    pub fn matches(&self, path: &str) -> bool {
        pattern::matches(&self.pattern, path)
    }
}

/// Outcome of an [`Mux::add`] call, reported so the caller can publish
/// conflict information outside the table lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new handler was created for the pattern.
    Mounted,
    /// The pattern already existed; the address was appended to it.
    AddressAdded { existing: Vec<String> },
    /// The pattern already held this address; nothing changed.
    Duplicate { existing: Vec<String> },
    /// The empty address is never mounted.
    EmptyAddress,
}

/// An HTTP request multiplexer mapping registered URL patterns to backend
/// service addresses. Pattern matching follows [`crate::core::pattern`].
#[derive(Debug, Default)]
pub struct Mux {
    routes: RwLock<HashMap<String, Vec<PatternHandler>>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` as a handler for `method` and `pattern` on behalf
    /// of `service`. The pattern is expected to already carry the mount
    /// prefix. Registration is idempotent: re-adding an existing
    /// `(method, pattern, address)` is a no-op reported as
    /// [`AddOutcome::Duplicate`].
    pub fn add(&self, method: &str, pattern: &str, address: &str, service: &str) -> AddOutcome {
        if address.is_empty() {
            tracing::warn!(method, pattern, service, "refusing to mount empty backend address");
            return AddOutcome::EmptyAddress;
        }

        let mut routes = self.routes.write().expect("mux lock poisoned");
        let handlers = routes.entry(method.to_string()).or_default();

        if let Some(handler) = handlers.iter_mut().find(|h| h.pattern == pattern) {
            if handler.addresses.iter().any(|a| a == address) {
                return AddOutcome::Duplicate {
                    existing: handler.addresses.clone(),
                };
            }
            let existing = handler.addresses.clone();
            handler.addresses.push(address.to_string());
            tracing::info!(method, pattern, address, service, "added backend to route");
            return AddOutcome::AddressAdded { existing };
        }

        handlers.push(PatternHandler {
            pattern: pattern.to_string(),
            addresses: vec![address.to_string()],
        });
        tracing::info!(method, pattern, address, service, "registered route");
        AddOutcome::Mounted
    }

    /// Unregister `address` as a handler for `method` and `pattern` on
    /// behalf of `service`. The caller supplies the pattern unprefixed; the
    /// mount prefix is applied here. When the last address of a handler is
    /// removed the handler itself is dropped, preserving the order of the
    /// remaining handlers.
    pub fn remove(&self, method: &str, pattern: &str, address: &str, service: &str) {
        let pattern = format!("{MOUNT_PREFIX}{pattern}");
        let mut routes = self.routes.write().expect("mux lock poisoned");
        let Some(handlers) = routes.get_mut(method) else {
            return;
        };

        if let Some(index) = handlers.iter().position(|h| h.pattern == pattern) {
            let handler = &mut handlers[index];
            let before = handler.addresses.len();
            handler.addresses.retain(|a| a != address);
            if handler.addresses.len() < before {
                tracing::info!(method, %pattern, address, service, "unregistered backend");
            }
            if handler.addresses.is_empty() {
                handlers.remove(index);
            }
        }
    }

    /// Find the backend addresses capable of handling `method` and `path`.
    /// The first handler (in registration order) whose pattern matches
    /// wins. Returns `None` when nothing matches.
    pub fn match_route(&self, method: &str, path: &str) -> Option<Vec<String>> {
        let routes = self.routes.read().expect("mux lock poisoned");
        routes
            .get(method)?
            .iter()
            .find(|handler| handler.matches(path))
            .map(|handler| handler.addresses.clone())
    }

    /// Number of mounted `(method, pattern)` handlers.
    pub fn handler_count(&self) -> usize {
        let routes = self.routes.read().expect("mux lock poisoned");
        routes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_creates_handler_and_match_finds_it() {
        let mux = Mux::new();
        assert_eq!(mux.add("GET", "/api/users", "10.0.0.1:8080", "users"), AddOutcome::Mounted);

        assert_eq!(
            mux.match_route("GET", "/api/users"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
        assert_eq!(mux.match_route("POST", "/api/users"), None);
        assert_eq!(mux.match_route("GET", "/api/unknown"), None);
    }

    #[test]
    fn add_is_idempotent() {
        let mux = Mux::new();
        mux.add("GET", "/api/users", "10.0.0.1:8080", "users");
        let outcome = mux.add("GET", "/api/users", "10.0.0.1:8080", "users");

        assert_eq!(
            outcome,
            AddOutcome::Duplicate {
                existing: vec!["10.0.0.1:8080".to_string()]
            }
        );
        assert_eq!(
            mux.match_route("GET", "/api/users"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
    }

    #[test]
    fn add_unions_addresses_for_shared_pattern() {
        let mux = Mux::new();
        mux.add("GET", "/api/users", "10.0.0.1:8080", "users");
        let outcome = mux.add("GET", "/api/users", "10.0.0.2:8080", "users");

        assert_eq!(
            outcome,
            AddOutcome::AddressAdded {
                existing: vec!["10.0.0.1:8080".to_string()]
            }
        );
        assert_eq!(
            mux.match_route("GET", "/api/users"),
            Some(vec![
                "10.0.0.1:8080".to_string(),
                "10.0.0.2:8080".to_string()
            ])
        );
    }

    #[test]
    fn empty_address_is_rejected() {
        let mux = Mux::new();
        assert_eq!(mux.add("GET", "/api/users", "", "users"), AddOutcome::EmptyAddress);
        assert_eq!(mux.match_route("GET", "/api/users"), None);
    }

    #[test]
    fn remove_prefixes_the_pattern_and_drops_empty_handlers() {
        let mux = Mux::new();
        mux.add("GET", "/api/users", "10.0.0.1:8080", "users");
        mux.add("GET", "/api/users", "10.0.0.2:8080", "users");

        mux.remove("GET", "/users", "10.0.0.1:8080", "users");
        assert_eq!(
            mux.match_route("GET", "/api/users"),
            Some(vec!["10.0.0.2:8080".to_string()])
        );

        mux.remove("GET", "/users", "10.0.0.2:8080", "users");
        assert_eq!(mux.match_route("GET", "/api/users"), None);
        assert_eq!(mux.handler_count(), 0);
    }

    #[test]
    fn add_then_remove_restores_prior_state() {
        let mux = Mux::new();
        mux.add("GET", "/api/a", "10.0.0.1:8080", "alpha");
        mux.add("GET", "/api/b", "10.0.0.2:8080", "beta");
        mux.add("GET", "/api/c", "10.0.0.3:8080", "gamma");

        mux.remove("GET", "/b", "10.0.0.2:8080", "beta");

        // Remaining handlers keep their relative order.
        assert_eq!(mux.handler_count(), 2);
        assert_eq!(
            mux.match_route("GET", "/api/a"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
        assert_eq!(
            mux.match_route("GET", "/api/c"),
            Some(vec!["10.0.0.3:8080".to_string()])
        );
    }

    #[test]
    fn first_registered_pattern_wins() {
        let mux = Mux::new();
        mux.add("GET", "/api/users/:id", "10.0.0.1:8080", "users");
        mux.add("GET", "/api/users/me", "10.0.0.2:8080", "users");

        // "/api/users/me" also matches the parameterised pattern, which was
        // registered first.
        assert_eq!(
            mux.match_route("GET", "/api/users/me"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
    }

    #[test]
    fn net_application_of_register_unregister_sequences() {
        let mux = Mux::new();
        // Apply a sequence with redundant adds and a full removal; the end
        // state must equal applying the net set once.
        mux.add("GET", "/api/users", "10.0.0.1:8080", "users");
        mux.add("GET", "/api/users", "10.0.0.1:8080", "users");
        mux.add("GET", "/api/users", "10.0.0.2:8080", "users");
        mux.add("POST", "/api/users", "10.0.0.1:8080", "users");
        mux.remove("GET", "/users", "10.0.0.2:8080", "users");

        assert_eq!(
            mux.match_route("GET", "/api/users"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
        assert_eq!(
            mux.match_route("POST", "/api/users"),
            Some(vec!["10.0.0.1:8080".to_string()])
        );
    }
}
