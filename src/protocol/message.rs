use serde_json::{Map, Value};

use super::response::{JsonRpcError, JsonRpcResponse, Outcome};
use crate::error::ClientError;

/// Anything the peer may write on its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Request initiated by the server; expects a reply with the same `id`.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Server push with no reply expected.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl TryFrom<Map<String, Value>> for InboundMessage {
    type Error = ClientError;

    /// Classify a decoded JSON object.
    ///
    /// Responses must carry an integer `id` and exactly one of `result` or
    /// `error`; a `null` result still counts as present.
    fn try_from(mut obj: Map<String, Value>) -> Result<Self, Self::Error> {
        if let Some(method) = obj.remove("method") {
            let method = match method {
                Value::String(m) => m,
                other => {
                    return Err(ClientError::malformed(format!(
                        "method must be a string, got {other}"
                    )))
                }
            };
            let params = obj.remove("params");
            return Ok(match obj.remove("id") {
                Some(Value::Null) | None => Self::Notification { method, params },
                Some(id) => Self::Request { id, method, params },
            });
        }

        let id = match obj.get("id") {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| ClientError::malformed(format!("id {n} is not an integer")))?,
            Some(other) => {
                return Err(ClientError::malformed(format!(
                    "response id must be an integer, got {other}"
                )))
            }
            None => return Err(ClientError::malformed("response without id")),
        };

        let outcome = match (obj.remove("result"), obj.remove("error")) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => {
                let error: JsonRpcError = serde_json::from_value(error)
                    .map_err(|e| ClientError::malformed(format!("invalid error object: {e}")))?;
                Outcome::Error(error)
            }
            (Some(_), Some(_)) => {
                return Err(ClientError::malformed(format!(
                    "response {id} carries both result and error"
                )))
            }
            (None, None) => {
                return Err(ClientError::malformed(format!(
                    "response {id} carries neither result nor error"
                )))
            }
        };

        Ok(Self::Response(JsonRpcResponse { id, outcome }))
    }
}
