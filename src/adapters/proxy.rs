//! Reverse-proxy data path.
//!
//! For each inbound request: match the path against the routing table, pick
//! one backend at random, rewrite the request for the backend, execute the
//! round-trip and relay the response. Misses and transport failures are
//! mapped onto the gateway's own responses; backend responses pass through
//! untouched.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::body::Body;
use hyper::{
    Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use rand::Rng;

use crate::{
    core::mux::{MOUNT_PREFIX, Mux},
    metrics,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    utils::net,
};

/// Body returned for requests no registered pattern matches.
const NOT_FOUND_BODY: &str = r#"[{"error":"404 Status Not Found"},{"status":404}]"#;

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// The proxy handler serving the gateway's public surface.
pub struct ProxyHandler {
    mux: Arc<Mux>,
    client: Arc<dyn HttpClient>,
    /// Preserve client-supplied X-Forwarded-* headers instead of
    /// overwriting them.
    trust_forward_header: bool,
    /// Advertised in X-Forwarded-Server.
    server_name: String,
}

impl ProxyHandler {
    pub fn new(mux: Arc<Mux>, client: Arc<dyn HttpClient>, trust_forward_header: bool) -> Self {
        Self {
            mux,
            client,
            trust_forward_header,
            server_name: net::hostname(),
        }
    }

    /// Dispatch one inbound request.
    pub async fn handle(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        tls: bool,
    ) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let Some(addresses) = self.mux.match_route(method.as_str(), &path) else {
            tracing::info!(%method, %path, "no pattern matched");
            metrics::increment_request(method.as_str(), StatusCode::NOT_FOUND.as_u16());
            return not_found_response();
        };

        let address = pick(&addresses).to_string();
        tracing::debug!(%method, %path, backend = %address, "proxying request");

        let outbound = match self.build_outbound(req, &address, client_addr, tls) {
            Ok(outbound) => outbound,
            Err(error) => {
                tracing::error!(%method, %path, %error, "could not build outbound request");
                metrics::increment_request(method.as_str(), 500);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self.client.round_trip(outbound).await {
            Ok(response) => {
                metrics::increment_request(method.as_str(), response.status().as_u16());
                metrics::increment_backend_request(&address);
                response
            }
            Err(error) => {
                let status = upstream_error_status(&error);
                tracing::error!(%method, %path, backend = %address, %error, status = status.as_u16(), "backend round-trip failed");
                metrics::increment_request(method.as_str(), status.as_u16());
                status_response(status)
            }
        }
    }

    /// Rewrite an inbound request for a backend: scheme http, host set to
    /// the chosen address, the mount prefix stripped from the path, raw
    /// query preserved. Hop-by-hop headers are dropped and forwarding
    /// headers applied.
    fn build_outbound(
        &self,
        req: Request<Body>,
        address: &str,
        client_addr: Option<SocketAddr>,
        tls: bool,
    ) -> HttpClientResult<Request<Body>> {
        let (parts, body) = req.into_parts();

        let path = parts.uri.path();
        let backend_path = path.strip_prefix(MOUNT_PREFIX).unwrap_or(path);
        let backend_path = if backend_path.is_empty() {
            "/"
        } else {
            backend_path
        };
        let uri = match parts.uri.query() {
            Some(query) => format!("http://{address}{backend_path}?{query}"),
            None => format!("http://{address}{backend_path}"),
        };

        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|error| HttpClientError::InvalidRequest(error.to_string()))?;

        let inbound_headers = &parts.headers;
        let headers = outbound.headers_mut();
        for (name, value) in inbound_headers {
            if is_hop_by_hop(name) || name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let client_ip = client_addr.map(|addr| addr.ip());
        self.apply_forwarding_headers(inbound_headers, headers, client_ip, tls);

        Ok(outbound)
    }

    fn apply_forwarding_headers(
        &self,
        inbound: &hyper::HeaderMap,
        outbound: &mut hyper::HeaderMap,
        client_ip: Option<IpAddr>,
        tls: bool,
    ) {
        if let Some(chain) = forwarded_for_chain(
            inbound.get("x-forwarded-for"),
            client_ip,
            self.trust_forward_header,
        ) {
            insert_header(outbound, "x-forwarded-for", &chain);
        }

        let proto = trusted_or(
            inbound.get("x-forwarded-proto"),
            self.trust_forward_header,
            if tls { "https" } else { "http" },
        );
        insert_header(outbound, "x-forwarded-proto", &proto);

        let inbound_host = inbound
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let host = trusted_or(
            inbound.get("x-forwarded-host"),
            self.trust_forward_header,
            inbound_host,
        );
        if !host.is_empty() {
            insert_header(outbound, "x-forwarded-host", &host);
        }

        insert_header(outbound, "x-forwarded-server", &self.server_name);
    }
}

/// Pick one address uniformly at random.
fn pick(addresses: &[String]) -> &str {
    let index = rand::rng().random_range(0..addresses.len());
    &addresses[index]
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.as_str().eq_ignore_ascii_case(hop))
}

/// Existing chain (when trusted) with the client IP appended.
fn forwarded_for_chain(
    existing: Option<&HeaderValue>,
    client_ip: Option<IpAddr>,
    trusted: bool,
) -> Option<String> {
    let prior = if trusted {
        existing
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    } else {
        None
    };
    match (prior, client_ip) {
        (Some(prior), Some(ip)) => Some(format!("{prior}, {ip}")),
        (Some(prior), None) => Some(prior),
        (None, Some(ip)) => Some(ip.to_string()),
        (None, None) => None,
    }
}

fn trusted_or(existing: Option<&HeaderValue>, trusted: bool, fallback: &str) -> String {
    if trusted {
        if let Some(value) = existing.and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    fallback.to_string()
}

fn insert_header(headers: &mut hyper::HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(error) => tracing::warn!(name, %error, "skipping unrepresentable forwarding header"),
    }
}

/// The gateway's pattern-miss response.
fn not_found_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(NOT_FOUND_BODY))
        .unwrap_or_else(|_| Response::new(Body::from(NOT_FOUND_BODY)))
}

/// A bare status response whose body is the HTTP status text.
fn status_response(status: StatusCode) -> Response<Body> {
    let body = status.canonical_reason().unwrap_or("");
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from(body)))
}

/// Map a transport failure onto the status the client sees.
fn upstream_error_status(error: &HttpClientError) -> StatusCode {
    match error {
        HttpClientError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        HttpClientError::Connection(_) | HttpClientError::UnexpectedEof(_) => {
            StatusCode::BAD_GATEWAY
        }
        HttpClientError::InvalidRequest(_) | HttpClientError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;

    /// Round-tripper that records the outbound request and answers from a
    /// script.
    struct ScriptedClient {
        seen: Mutex<Vec<Request<Body>>>,
        reply: Box<dyn Fn() -> HttpClientResult<Response<Body>> + Send + Sync>,
    }

    impl ScriptedClient {
        fn replying(
            reply: impl Fn() -> HttpClientResult<Response<Body>> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            })
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn round_trip(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(req);
            (self.reply)()
        }
    }

    fn mux_with_route(method: &str, pattern: &str, address: &str) -> Arc<Mux> {
        let mux = Arc::new(Mux::new());
        mux.add(method, pattern, address, "test-service");
        mux
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn miss_returns_the_json_not_found_body() {
        let mux = Arc::new(Mux::new());
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            body_string(response).await,
            r#"[{"error":"404 Status Not Found"},{"status":404}]"#
        );
    }

    #[tokio::test]
    async fn request_is_rewritten_for_the_backend() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client.clone(), false);

        let req = Request::builder()
            .uri("/api/users?page=2&sort=name")
            .header(header::HOST, "gateway.example.com")
            .body(Body::empty())
            .unwrap();
        let response = handler
            .handle(req, Some("192.0.2.7:55555".parse().unwrap()), false)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = client.seen.lock().unwrap();
        let outbound = &seen[0];
        assert_eq!(
            outbound.uri().to_string(),
            "http://10.0.0.1:8080/users?page=2&sort=name"
        );
        assert_eq!(
            outbound.headers().get("x-forwarded-for").unwrap(),
            "192.0.2.7"
        );
        assert_eq!(outbound.headers().get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(
            outbound.headers().get("x-forwarded-host").unwrap(),
            "gateway.example.com"
        );
        assert!(outbound.headers().contains_key("x-forwarded-server"));
    }

    #[tokio::test]
    async fn hop_by_hop_headers_are_stripped() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client.clone(), false);

        let req = Request::builder()
            .uri("/api/users")
            .header("Connection", "keep-alive")
            .header("Keep-Alive", "timeout=5")
            .header("Transfer-Encoding", "chunked")
            .header("Upgrade", "websocket")
            .header("X-Request-Trace", "abc")
            .body(Body::empty())
            .unwrap();
        handler.handle(req, None, false).await;

        let seen = client.seen.lock().unwrap();
        let headers = seen[0].headers();
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("upgrade"));
        assert_eq!(headers.get("x-request-trace").unwrap(), "abc");
    }

    #[tokio::test]
    async fn forward_headers_are_preserved_when_trusted() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client.clone(), true);

        let req = Request::builder()
            .uri("/api/users")
            .header("X-Forwarded-For", "203.0.113.9")
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-Host", "public.example.com")
            .body(Body::empty())
            .unwrap();
        handler
            .handle(req, Some("192.0.2.7:55555".parse().unwrap()), false)
            .await;

        let seen = client.seen.lock().unwrap();
        let headers = seen[0].headers();
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 192.0.2.7"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "public.example.com"
        );
    }

    #[tokio::test]
    async fn untrusted_forward_headers_are_replaced() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client.clone(), false);

        let req = Request::builder()
            .uri("/api/users")
            .header("X-Forwarded-For", "203.0.113.9")
            .header("X-Forwarded-Proto", "https")
            .body(Body::empty())
            .unwrap();
        handler
            .handle(req, Some("192.0.2.7:55555".parse().unwrap()), false)
            .await;

        let seen = client.seen.lock().unwrap();
        let headers = seen[0].headers();
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "192.0.2.7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    }

    #[tokio::test]
    async fn backend_response_is_relayed_verbatim() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| {
            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .header("X-Service-Version", "7")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"ok":true}"#))
                .unwrap())
        });
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/users")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-service-version").unwrap(), "7");
        assert_eq!(body_string(response).await, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| {
            Err(HttpClientError::Timeout("deadline exceeded".to_string()))
        });
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/users")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_string(response).await, "Gateway Timeout");
    }

    #[tokio::test]
    async fn connection_errors_map_to_bad_gateway() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| {
            Err(HttpClientError::Connection("connection refused".to_string()))
        });
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/users")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, "Bad Gateway");
    }

    #[tokio::test]
    async fn early_eof_maps_to_bad_gateway() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client = ScriptedClient::replying(|| {
            Err(HttpClientError::UnexpectedEof("connection closed".to_string()))
        });
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/users")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn other_failures_map_to_internal_server_error() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        let client =
            ScriptedClient::replying(|| Err(HttpClientError::Internal("boom".to_string())));
        let handler = ProxyHandler::new(mux, client, false);

        let req = Request::builder()
            .uri("/api/users")
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req, None, false).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Internal Server Error");
    }

    #[tokio::test]
    async fn load_is_spread_across_backends() {
        let mux = mux_with_route("GET", "/api/users", "10.0.0.1:8080");
        mux.add("GET", "/api/users", "10.0.0.2:8080", "test-service");
        let client = ScriptedClient::replying(|| Ok(Response::new(Body::empty())));
        let handler = ProxyHandler::new(mux, client.clone(), false);

        for _ in 0..200 {
            let req = Request::builder()
                .uri("/api/users")
                .body(Body::empty())
                .unwrap();
            handler.handle(req, None, false).await;
        }

        let seen = client.seen.lock().unwrap();
        let first = seen
            .iter()
            .filter(|r| r.uri().authority().unwrap().as_str() == "10.0.0.1:8080")
            .count();
        let second = seen.len() - first;
        // Uniform selection: both backends see a healthy share.
        assert!(first > 50, "first backend saw only {first} of 200");
        assert!(second > 50, "second backend saw only {second} of 200");
    }
}
