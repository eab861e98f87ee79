//! HTTP client for the daemon's local control plane
//!
//! Every operation returns a normalized reply. Transport failures, non-JSON
//! bodies and HTTP errors are folded into the reply's `error` field, so
//! callers never see an `Err` from this layer.

use super::protocol::{
    CommandReply, ConnectRequest, DEFAULT_BIND, DiagnosticsReply, IdentityReply, PortProbe,
    ProxyTestReply, StatusReply, error_of,
};
use super::{ClientError, ControlPlane};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the local TCP liveness probe
const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Timeout for one latency sample
const LATENCY_TIMEOUT: Duration = Duration::from_secs(3);

/// Client for `http://<listen>/v1/*`
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: Client,
}

impl ControlPlaneClient {
    /// Create a client for a daemon listening on `listen` (e.g. `127.0.0.1:4765`)
    pub fn new(listen: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self::with_client(format!("http://{}", listen), http))
    }

    /// Create a client from an existing base URL and HTTP client
    pub fn with_client(base_url: String, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        self.send(path, self.http.get(self.url(path))).await
    }

    async fn post(&self, path: &str) -> Result<Value, ClientError> {
        self.send(path, self.http.post(self.url(path))).await
    }

    /// Send a request and parse its JSON body
    ///
    /// A non-2xx response is still parsed: the daemon reports command
    /// failures as `400 {"error": ...}` and that error must reach the caller.
    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Value, ClientError> {
        debug!("Control plane request: {}", path);

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let value = match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => value,
            Err(_) if !status.is_success() => return Err(ClientError::Http(status.as_u16())),
            Err(e) => return Err(ClientError::InvalidBody(e)),
        };

        if !status.is_success() && error_of(&value).is_none() {
            return Err(ClientError::Http(status.as_u16()));
        }

        debug!("Control plane response: {} -> {}", path, status);
        Ok(value)
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn health(&self) -> bool {
        match self.http.get(self.url("/v1/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    async fn get_status(&self) -> StatusReply {
        match self.get("/v1/status").await {
            Ok(v) => StatusReply::from_value(&v),
            Err(e) => StatusReply::failed(e.to_string()),
        }
    }

    async fn connect(&self, request: &ConnectRequest) -> CommandReply {
        let builder = self.http.post(self.url("/v1/connect")).json(request);
        match self.send("/v1/connect", builder).await {
            Ok(v) => CommandReply::from_value(&v),
            Err(e) => CommandReply::failed(e.to_string()),
        }
    }

    async fn disconnect(&self) -> CommandReply {
        match self.post("/v1/disconnect").await {
            Ok(v) => CommandReply::from_value(&v),
            Err(e) => CommandReply::failed(e.to_string()),
        }
    }

    async fn test_proxy(&self, bind: Option<&str>) -> ProxyTestReply {
        let mut builder = self.http.get(self.url("/v1/test/socks"));
        if let Some(bind) = bind {
            builder = builder.query(&[("bind", bind)]);
        }
        match self.send("/v1/test/socks", builder).await {
            Ok(v) => ProxyTestReply::from_value(&v),
            Err(e) => ProxyTestReply::failed(e.to_string()),
        }
    }

    async fn probe_port(&self, bind: Option<&str>) -> PortProbe {
        let addr = bind.unwrap_or(DEFAULT_BIND);
        let listening = matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)));
        debug!("Port probe {}: listening={}", addr, listening);
        PortProbe { listening }
    }

    async fn measure_latency(&self, host: &str) -> Option<u64> {
        let started = Instant::now();
        match timeout(LATENCY_TIMEOUT, TcpStream::connect(host)).await {
            Ok(Ok(_)) => Some(started.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                debug!("Latency probe to {} failed: {}", host, e);
                None
            }
            Err(_) => {
                debug!("Latency probe to {} timed out", host);
                None
            }
        }
    }

    async fn get_identity(&self) -> IdentityReply {
        match self.get("/v1/identity").await {
            Ok(v) => IdentityReply::from_value(&v),
            Err(e) => IdentityReply::failed(e.to_string()),
        }
    }

    async fn reset_identity(&self) -> CommandReply {
        match self.post("/v1/identity/reset").await {
            Ok(v) => CommandReply::from_value(&v),
            Err(e) => CommandReply::failed(e.to_string()),
        }
    }

    async fn get_diagnostics(&self) -> DiagnosticsReply {
        match self.get("/v1/diag").await {
            Ok(v) => DiagnosticsReply::from_value(v),
            Err(e) => DiagnosticsReply::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::Provider;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ControlPlaneClient {
        ControlPlaneClient::with_client(server.uri(), Client::new())
    }

    /// An address nothing listens on
    fn dead_listen() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_status_normalizes_pascal_case() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connected": true,
                "Bind": "127.0.0.1:8086",
                "message": "ok",
                "SingBox": true
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).get_status().await;
        assert!(status.connected);
        assert_eq!(status.bind.as_deref(), Some("127.0.0.1:8086"));
        assert!(status.tun_active);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejection_surfaces_error() {
        let server = MockServer::start().await;
        let request = ConnectRequest::new(Provider::Warp);
        Mock::given(method("POST"))
            .and(path("/v1/connect"))
            .and(body_json(json!({
                "provider": "warp",
                "options": {"integration": "direct"}
            })))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "unknown provider"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reply = client_for(&server).connect(&request).await;
        assert_eq!(reply.error.as_deref(), Some("unknown provider"));
    }

    #[tokio::test]
    async fn test_http_error_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/disconnect"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reply = client_for(&server).disconnect().await;
        assert_eq!(reply.error.as_deref(), Some("Unexpected response: HTTP 500"));
    }

    #[tokio::test]
    async fn test_invalid_body_is_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let status = client_for(&server).get_status().await;
        assert!(!status.connected);
        assert!(status.error.unwrap().starts_with("Invalid response body"));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_normalized() {
        let client = ControlPlaneClient::new(&dead_listen(), Duration::from_secs(2)).unwrap();

        let status = client.get_status().await;
        assert!(status.error.unwrap().starts_with("Control plane unreachable"));
        assert!(client.disconnect().await.error.is_some());
        assert!(client.get_identity().await.error.is_some());
        assert!(!client.health().await);
    }

    #[tokio::test]
    async fn test_proxy_test_passes_bind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/test/socks"))
            .and(query_param("bind", "127.0.0.1:9000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "HTTP/1.1 200 OK",
                "body": "{}"
            })))
            .mount(&server)
            .await;

        let reply = client_for(&server).test_proxy(Some("127.0.0.1:9000")).await;
        assert!(reply.error.is_none());
        assert_eq!(reply.status_line.as_deref(), Some("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_health_and_identity_reset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/identity/reset"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "reset"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.health().await);
        assert!(client.reset_identity().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = ControlPlaneClient::with_client("http://127.0.0.1:1".into(), Client::new());

        assert!(client.probe_port(Some(&addr)).await.listening);
        drop(listener);
        assert!(!client.probe_port(Some(&dead_listen())).await.listening);
    }
}
