//! Portico - an API gateway backed by an etcd service registry.
//!
//! Portico continuously mirrors a hierarchical service registry into an
//! in-process routing table and reverse-proxies inbound HTTP requests to
//! backend service instances. Services publish their routes and host
//! addresses under `/<namespace>/<service>/<environment>/...`; the gateway
//! watches that tree and keeps its routing table converged with it across
//! restarts, partial failures and event reordering.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping business logic inside `core`:
//! * [`core::Mux`]: the concurrent routing table, `(method, pattern)` to
//!   backend addresses, with pat-style parameterised matching and random
//!   load balancing.
//! * [`core::Exchange`]: the registry mirror, one recursive read at boot,
//!   then a long-lived watch loop translating registry events into
//!   register / unregister calls on the mux.
//! * [`core::LivenessPublisher`]: advertises this gateway's own address
//!   under a TTL'd registry key so peers can discover it.
//! * [`adapters::ProxyHandler`]: the reverse-proxy data path, request
//!   rewriting, forwarding headers, round-trip and response relay.
//! * [`adapters::EtcdRegistry`]: the registry port implemented over the
//!   etcd v2 keys HTTP API.
//!
//! # Error Handling
//! Fallible wiring returns `eyre::Result<T>`; the ports expose domain error
//! enums (`RegistryError`, `HttpClientError`). The watch loop recovers from
//! every per-event failure; only startup (missing configuration, failed
//! initial sync, bind errors) is fatal.
//!
//! # Concurrency
//! The listener, the watch loop and the liveness publisher are independent
//! tokio tasks. The mux's reader-writer lock is the only mutex, never held
//! across a suspension point.

pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{EtcdRegistry, HttpClientAdapter, ProxyHandler},
    config::GatewayConfig,
    core::{Exchange, LivenessPublisher, Mux, ServiceRecord},
    ports::{http_client::HttpClient, registry::Registry},
    utils::GracefulShutdown,
};
