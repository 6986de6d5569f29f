pub mod exchange;
pub mod keys;
pub mod mux;
pub mod pattern;
pub mod publisher;
pub mod service;

pub use exchange::Exchange;
pub use mux::{AddOutcome, Mux, PatternHandler};
pub use publisher::LivenessPublisher;
pub use service::{Routes, ServiceRecord};
