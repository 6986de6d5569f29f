use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Failure modes of an upstream round-trip, classified so the proxy can map
/// them onto response statuses.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The round-trip exceeded its deadline.
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset.
    #[error("upstream connection error: {0}")]
    Connection(String),

    /// The upstream closed the connection before a complete response.
    #[error("upstream closed early: {0}")]
    UnexpectedEof(String),

    /// The outbound request could not be constructed.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    /// Any other transport failure.
    #[error("upstream failure: {0}")]
    Internal(String),
}

/// Result type alias for round-trip operations.
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient is the port for the proxy's round-tripper. The data path only
/// depends on this trait, so tests can substitute a scripted upstream.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Execute one request against a backend and return its response.
    async fn round_trip(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}
