//! Outbound request seam.
//!
//! DESIGN
//! ======
//! `ChannelTransport` has one method per provider request. The handshake and
//! lifecycle only see status codes, text bodies, and byte streams, so tests
//! swap in a scripted transport while `HttpTransport` speaks real HTTP.
//!
//! The reqwest client carries no global timeout: the stream request is
//! long-lived, so timeouts are applied per request to the short calls only.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Method, Request, RequestBuilder};
use serde_json::json;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Step};

/// Protocol version sent as `VER`.
pub const PROTOCOL_VERSION: &str = "8";

/// Chunks of the open stream, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ChannelError>>;

/// Status and body of a completed short request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChooseServerRequest {
    pub rooms: Vec<String>,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub server_session_id: String,
    pub rooms: Vec<String>,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub server_session_id: String,
    pub sid: String,
    /// Acknowledged sequence, sent as `AID`.
    pub last_sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub server_session_id: String,
    pub credentials_token: String,
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Handshake step 1: ask which server hosts the rooms.
    async fn choose_server(&self, request: ChooseServerRequest) -> Result<TransportResponse, ChannelError>;

    /// Zero-body request announcing the new `gsessionid` to the stream endpoint.
    async fn preflight(&self, server_session_id: &str) -> Result<TransportResponse, ChannelError>;

    /// Handshake step 2: obtain the stream `SID`.
    async fn bind(&self, request: BindRequest) -> Result<TransportResponse, ChannelError>;

    /// Open the long-poll stream. A non-success status is an error.
    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, ChannelError>;

    async fn refresh_credentials(&self, request: RefreshRequest) -> Result<TransportResponse, ChannelError>;
}

// =============================================================================
// HTTP TRANSPORT
// =============================================================================

pub struct HttpTransport {
    http: reqwest::Client,
    /// Origin, Referer, and User-Agent, attached to every request.
    headers: HeaderMap,
    api_key: String,
    base_url: String,
    stream_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build an HTTP transport with the fixed origin headers and the
    /// configured identification header.
    ///
    /// # Errors
    ///
    /// Returns an error if a header value is invalid or the client fails to build.
    pub fn new(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let header = |name: &str, value: String| {
            HeaderValue::from_str(&value).map_err(|e| ChannelError::Config(format!("invalid {name} header: {e}")))
        };
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, header("origin", config.origin.clone())?);
        headers.insert(REFERER, header("referer", format!("{}/", config.origin))?);
        headers.insert(USER_AGENT, header("user-agent", config.user_agent.clone())?);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| ChannelError::HttpClientBuild(e.to_string()))?;

        Ok(Self {
            http,
            headers,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            stream_url: config.stream_url.clone(),
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).headers(self.headers.clone())
    }

    // ===== REQUEST BUILDERS =====

    fn choose_server_request(&self, request: &ChooseServerRequest) -> Result<Request, ChannelError> {
        let url = format!("{}/chooseServer", self.base_url);
        let rid = request.request_id.to_string();
        let builder = self
            .request(Method::POST, &url)
            .query(&[("key", self.api_key.as_str()), ("RID", rid.as_str())])
            .json(&rooms_body(&request.rooms))
            .timeout(self.request_timeout);
        build(Step::ChooseServer, builder)
    }

    fn preflight_request(&self, server_session_id: &str) -> Result<Request, ChannelError> {
        let builder = self
            .request(Method::OPTIONS, &self.stream_url)
            .query(&[("VER", PROTOCOL_VERSION), ("gsessionid", server_session_id), ("key", self.api_key.as_str())])
            .timeout(self.request_timeout);
        build(Step::Preflight, builder)
    }

    fn bind_request(&self, request: &BindRequest) -> Result<Request, ChannelError> {
        let rid = request.request_id.to_string();
        let zx = cache_buster();
        let data = rooms_body(&request.rooms).to_string();
        let builder = self
            .request(Method::POST, &self.stream_url)
            .query(&[
                ("VER", PROTOCOL_VERSION),
                ("gsessionid", request.server_session_id.as_str()),
                ("key", self.api_key.as_str()),
                ("RID", rid.as_str()),
                ("CVER", "22"),
                ("zx", zx.as_str()),
                ("t", "1"),
            ])
            .form(&[("count", "1"), ("ofs", "0"), ("req0___data__", data.as_str())])
            .timeout(self.request_timeout);
        build(Step::Bind, builder)
    }

    /// The stream request is long-lived and carries no timeout.
    fn stream_request(&self, request: &StreamRequest) -> Result<Request, ChannelError> {
        let aid = request.last_sequence.to_string();
        let zx = cache_buster();
        let builder = self
            .request(Method::GET, &self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .query(&[
                ("VER", PROTOCOL_VERSION),
                ("gsessionid", request.server_session_id.as_str()),
                ("SID", request.sid.as_str()),
                ("RID", "rpc"),
                ("TYPE", "xmlhttp"),
                ("AID", aid.as_str()),
                ("CI", "0"),
                ("key", self.api_key.as_str()),
                ("zx", zx.as_str()),
                ("t", "1"),
            ]);
        build(Step::OpenStream, builder)
    }

    fn refresh_request(&self, request: &RefreshRequest) -> Result<Request, ChannelError> {
        let url = format!("{}/refreshCreds", self.base_url);
        let builder = self
            .request(Method::POST, &url)
            .query(&[("key", self.api_key.as_str()), ("gsessionid", request.server_session_id.as_str())])
            .json(&json!([request.credentials_token]))
            .timeout(self.request_timeout);
        build(Step::Refresh, builder)
    }

    async fn send(&self, step: Step, request: Request) -> Result<TransportResponse, ChannelError> {
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| ChannelError::Request { step, message: e.to_string() })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ChannelError::Request { step, message: e.to_string() })?;
        debug!(%step, status, bytes = body.len(), "response received");
        Ok(TransportResponse { status, body })
    }
}

fn build(step: Step, builder: RequestBuilder) -> Result<Request, ChannelError> {
    builder.build().map_err(|e| ChannelError::Request { step, message: e.to_string() })
}

/// Cache-busting token appended to stream endpoint requests.
fn cache_buster() -> String {
    let n: u64 = rand::rng().random();
    format!("{n:x}")
}

fn rooms_body(rooms: &[String]) -> serde_json::Value {
    json!([[null, rooms]])
}

#[async_trait::async_trait]
impl ChannelTransport for HttpTransport {
    async fn choose_server(&self, request: ChooseServerRequest) -> Result<TransportResponse, ChannelError> {
        let request = self.choose_server_request(&request)?;
        self.send(Step::ChooseServer, request).await
    }

    async fn preflight(&self, server_session_id: &str) -> Result<TransportResponse, ChannelError> {
        let request = self.preflight_request(server_session_id)?;
        self.send(Step::Preflight, request).await
    }

    async fn bind(&self, request: BindRequest) -> Result<TransportResponse, ChannelError> {
        let request = self.bind_request(&request)?;
        self.send(Step::Bind, request).await
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, ChannelError> {
        let request = self.stream_request(&request)?;
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| ChannelError::Request { step: Step::OpenStream, message: e.to_string() })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status { step: Step::OpenStream, status, body });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| ChannelError::StreamEnded(e.to_string()))
            })
            .boxed())
    }

    async fn refresh_credentials(&self, request: RefreshRequest) -> Result<TransportResponse, ChannelError> {
        let request = self.refresh_request(&request)?;
        self.send(Step::Refresh, request).await
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
