use std::time::Duration;

use serde_json::Value;

use crate::session::SessionState;

/// Every failure the client can surface.
///
/// Peer-supplied `code`, `message` and `data` are carried verbatim so callers
/// can tell failure kinds apart without parsing display strings.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The child process could not be started, or the byte stream to it broke.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// One inbound line could not be read as a JSON-RPC message.
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("no response to {method} (id {id}) within {timeout:?}")]
    Timeout {
        method: String,
        id: u64,
        timeout: Duration,
    },

    #[error("connection closed before {method} (id {id}) was answered")]
    ConnectionClosed { method: String, id: u64 },

    #[error("tool {name} failed with code {code}: {message}")]
    ToolCall {
        name: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("session is {state}, not ready")]
    NotReady { state: SessionState },

    #[error("initialize rejected with code {code}: {message}")]
    Handshake {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("unexpected {method} result: {reason}")]
    UnexpectedResult { method: String, reason: String },

    #[error("request id {id} is already in flight")]
    DuplicateRequestId { id: u64 },

    #[error("cannot encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("arguments for {tool} do not match its input schema: {}", errors.join("; "))]
    InvalidArguments { tool: String, errors: Vec<String> },
}

impl ClientError {
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}
