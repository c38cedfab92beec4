use serde::Serialize;
use serde_json::Value;

/// JSON-RPC version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision offered during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outbound JSON-RPC 2.0 message: a request when `id` is set, a notification
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            id: Some(id),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            id: None,
            params,
        }
    }
}

/// MCP `initialize` params.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn new(client_info: ClientInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: Value::Object(serde_json::Map::new()),
            client_info,
        }
    }
}

/// Identity announced to the peer during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for `tools/call`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}

/// Parameters for a follow-up `tools/list` page.
#[derive(Debug, Clone, Serialize)]
pub struct ListToolsParams {
    pub cursor: String,
}
