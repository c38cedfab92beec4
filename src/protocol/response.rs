use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 response layer
// ---------------------------------------------------------------------------

/// Inbound JSON-RPC 2.0 response. Exactly one of result/error, enforced by
/// [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: i64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

impl JsonRpcResponse {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: i64, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// JSON-RPC 2.0 error object as sent by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }
}

/// Outbound reply to a server-initiated request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: super::JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// MCP result layer (carried inside a *successful* JSON-RPC response)
// ---------------------------------------------------------------------------

/// Result of `initialize`. Every field is optional; peers answer with as
/// little as `{"serverInfo":{}}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Value>,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A tool advertised by the peer. Only ever read from `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    /// Check `arguments` against this tool's `inputSchema`.
    ///
    /// Tools without a schema accept anything.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), ClientError> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };
        crate::schema::validate_value(schema, arguments).map_err(|err| {
            ClientError::InvalidArguments {
                tool: self.name.clone(),
                errors: err.messages(),
            }
        })
    }
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// A memory record returned by `ultrathink_retrieve`.
///
/// Peers vary in what they fill in, so every field defaults and anything
/// unrecognised is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MemoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}
