//! Scripted in-memory transport and fixtures shared by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use crate::backoff::ReconnectPolicy;
use crate::error::{ChannelError, Step};
use crate::event::EventBus;
use crate::refresh::CredentialRefresher;
use crate::session::SessionContext;
use crate::transport::{
    BindRequest, ByteStream, ChannelTransport, ChooseServerRequest, RefreshRequest, StreamRequest, TransportResponse,
};

// =========================================================================
// Responses
// =========================================================================

pub fn ok(body: impl Into<String>) -> Result<TransportResponse, ChannelError> {
    Ok(TransportResponse { status: 200, body: body.into() })
}

pub fn status(code: u16) -> Result<TransportResponse, ChannelError> {
    Ok(TransportResponse { status: code, body: String::new() })
}

pub fn rejected(step: Step) -> Result<TransportResponse, ChannelError> {
    Err(ChannelError::Request { step, message: "connection refused".into() })
}

pub fn choose_body(gsessionid: &str) -> String {
    json!([gsessionid, 3]).to_string()
}

pub fn bind_body(ack: i64, sid: &str) -> String {
    format!("{ack}\n{}\n", json!([[0, ["c", sid, "gsid", 8, 12, 30000]]]))
}

/// Encoded session-established frame carrying `token`.
pub fn established_frame(token: &str) -> Vec<u8> {
    frames::encode_frame(&json!([[1, ["c", [[null, null, [token]]]]]]))
}

pub fn ping_frame(sequence: i64, ts: &str) -> Vec<u8> {
    frames::encode_frame(&json!([[sequence, ["noop", [[null, [null, null, ts]]]]]]))
}

pub fn data_payload(sequence: i64, text: &str) -> Value {
    json!([[sequence, ["msg", {"text": text}]]])
}

pub fn data_frame(sequence: i64, text: &str) -> Vec<u8> {
    frames::encode_frame(&data_payload(sequence, text))
}

// =========================================================================
// Stream scripts
// =========================================================================

/// How a scripted stream behaves after its chunks are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Stay open forever.
    Hold,
    /// End the stream cleanly.
    Close,
}

pub struct StreamScript {
    pub chunks: Vec<Vec<u8>>,
    pub end: StreamEnd,
}

impl StreamScript {
    pub fn hold(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks, end: StreamEnd::Hold }
    }

    pub fn close(chunks: Vec<Vec<u8>>) -> Self {
        Self { chunks, end: StreamEnd::Close }
    }
}

// =========================================================================
// ScriptedTransport
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ChooseServer(ChooseServerRequest),
    Preflight(String),
    Bind(BindRequest),
    OpenStream(StreamRequest),
    Refresh(RefreshRequest),
}

/// Replays queued responses. Empty queues fall back to a successful default;
/// an empty stream queue yields a stream that stays open with no data.
#[derive(Default)]
pub struct ScriptedTransport {
    pub choose: Mutex<VecDeque<Result<TransportResponse, ChannelError>>>,
    pub binds: Mutex<VecDeque<Result<TransportResponse, ChannelError>>>,
    pub streams: Mutex<VecDeque<Result<StreamScript, ChannelError>>>,
    pub refreshes: Mutex<VecDeque<Result<TransportResponse, ChannelError>>>,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_choose(&self, response: Result<TransportResponse, ChannelError>) {
        self.choose.lock().unwrap().push_back(response);
    }

    pub fn push_bind(&self, response: Result<TransportResponse, ChannelError>) {
        self.binds.lock().unwrap().push_back(response);
    }

    pub fn push_stream(&self, script: Result<StreamScript, ChannelError>) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_refresh(&self, response: Result<TransportResponse, ChannelError>) {
        self.refreshes.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn choose_server(&self, request: ChooseServerRequest) -> Result<TransportResponse, ChannelError> {
        self.record(Call::ChooseServer(request));
        let next = self.choose.lock().unwrap().pop_front();
        next.unwrap_or_else(|| ok(choose_body("gsid-default")))
    }

    async fn preflight(&self, server_session_id: &str) -> Result<TransportResponse, ChannelError> {
        self.record(Call::Preflight(server_session_id.to_string()));
        ok("")
    }

    async fn bind(&self, request: BindRequest) -> Result<TransportResponse, ChannelError> {
        self.record(Call::Bind(request));
        let next = self.binds.lock().unwrap().pop_front();
        next.unwrap_or_else(|| ok(bind_body(5, "sid-default")))
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, ChannelError> {
        self.record(Call::OpenStream(request));
        let next = self.streams.lock().unwrap().pop_front();
        let script = next.unwrap_or_else(|| Ok(StreamScript::hold(Vec::new())))?;
        let chunks = futures::stream::iter(script.chunks.into_iter().map(Ok));
        Ok(match script.end {
            StreamEnd::Hold => chunks.chain(futures::stream::pending()).boxed(),
            StreamEnd::Close => chunks.boxed(),
        })
    }

    async fn refresh_credentials(&self, request: RefreshRequest) -> Result<TransportResponse, ChannelError> {
        self.record(Call::Refresh(request));
        let next = self.refreshes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| ok("[]"))
    }
}

// =========================================================================
// Context
// =========================================================================

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(240);

/// Session context over `transport` with 1s..30s backoff and `max_attempts`.
pub fn context(transport: Arc<ScriptedTransport>, max_attempts: i64) -> SessionContext {
    let bus = EventBus::new(256);
    let transport: Arc<dyn ChannelTransport> = transport;
    let refresher = CredentialRefresher::new(Arc::clone(&transport), bus.clone(), REFRESH_INTERVAL);
    SessionContext {
        transport,
        bus,
        policy: ReconnectPolicy::new(Duration::from_millis(1000), Duration::from_millis(30_000), max_attempts),
        refresher,
    }
}
