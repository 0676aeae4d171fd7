//! Error types for the channel client.
//!
//! Transport and protocol failures share one enum; the session lifecycle
//! routes every variant to the reconnect policy. Frame-level failures live in
//! the `frames` crate and never abort a stream.

use std::fmt;

// =============================================================================
// SHAPE ERROR
// =============================================================================

/// A positional structure did not match its documented shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unexpected {what} shape at {path}")]
pub struct ShapeError {
    /// Name of the structure being decoded, e.g. `"session config tuple"`.
    pub what: &'static str,
    /// Positional path that failed, e.g. `"[0][1][1]"`.
    pub path: String,
}

impl ShapeError {
    pub(crate) fn new(what: &'static str, path: impl Into<String>) -> Self {
        Self { what, path: path.into() }
    }
}

// =============================================================================
// REQUEST STEP
// =============================================================================

/// Outbound request kind, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ChooseServer,
    Preflight,
    Bind,
    OpenStream,
    Refresh,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChooseServer => "choose-server",
            Self::Preflight => "preflight",
            Self::Bind => "bind",
            Self::OpenStream => "open-stream",
            Self::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

// =============================================================================
// CHANNEL ERROR
// =============================================================================

/// Errors produced while establishing or running a session.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A configuration value is missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request was rejected before a response arrived.
    #[error("{step} request failed: {message}")]
    Request { step: Step, message: String },

    /// The provider answered with a non-success status.
    #[error("{step} returned status {status}")]
    Status { step: Step, status: u16, body: String },

    /// The open stream ended or failed mid-read.
    #[error("stream ended: {0}")]
    StreamEnded(String),

    /// A handshake response was incomplete or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A positional structure did not match its documented shape.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl ChannelError {
    /// Grepable error code carried on error events.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "E_CONFIG",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Request { .. } => "E_REQUEST",
            Self::Status { .. } => "E_STATUS",
            Self::StreamEnded(_) => "E_STREAM_ENDED",
            Self::Handshake(_) => "E_HANDSHAKE",
            Self::Shape(_) => "E_SHAPE",
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
