use std::{error::Error as StdError, io, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upper bound on one backend round-trip. Requests still in flight at the
/// deadline are reported as gateway timeouts.
const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(60);

/// Round-tripper adapter using Hyper with Rustls (HTTP/1.1).
///
/// Responsibilities:
/// * Executes outbound requests built by the proxy data path
/// * Bounds each round-trip with a deadline
/// * Classifies transport failures so the proxy can map them to statuses
/// * Re-frames the response body for the serving side
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    round_trip_timeout: Duration,
}

impl HttpClientAdapter {
    /// Create a new round-tripper.
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self {
            client,
            round_trip_timeout: ROUND_TRIP_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, round_trip_timeout: Duration) -> Self {
        self.round_trip_timeout = round_trip_timeout;
        self
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn round_trip(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        let client = self.client.clone();
        let uri = req.uri().clone();

        let response = match timeout(self.round_trip_timeout, client.request(req)).await {
            Err(_) => {
                return Err(HttpClientError::Timeout(format!(
                    "round-trip to {uri} exceeded {:?}",
                    self.round_trip_timeout
                )));
            }
            Ok(Err(error)) => return Err(classify(&error)),
            Ok(Ok(response)) => response,
        };

        // The body is re-framed on the way out; stale framing headers would
        // contradict what the serving side writes.
        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::TRANSFER_ENCODING);

        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Classify a client error by walking its source chain.
fn classify(error: &hyper_util::client::legacy::Error) -> HttpClientError {
    if error.is_connect() {
        return HttpClientError::Connection(error.to_string());
    }

    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return match io_error.kind() {
                io::ErrorKind::TimedOut => HttpClientError::Timeout(error.to_string()),
                io::ErrorKind::UnexpectedEof => HttpClientError::UnexpectedEof(error.to_string()),
                _ => HttpClientError::Connection(error.to_string()),
            };
        }
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>() {
            if hyper_error.is_incomplete_message() {
                return HttpClientError::UnexpectedEof(error.to_string());
            }
            if hyper_error.is_timeout() {
                return HttpClientError::Timeout(error.to_string());
            }
        }
        source = cause.source();
    }

    HttpClientError::Internal(error.to_string())
}
