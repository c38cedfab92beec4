use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::correlator::Correlator;
use crate::framer;
use crate::protocol::{InboundMessage, JsonRpcError, JsonRpcReply};
use crate::transport::{LineReader, Transport};

/// The one task that owns the read side of the connection.
///
/// It only ever blocks on the next inbound line. Replies to server-initiated
/// requests are written from separate tasks.
#[derive(Debug)]
pub struct BackgroundReader {
    handle: JoinHandle<()>,
}

impl BackgroundReader {
    pub fn spawn(
        lines: LineReader,
        correlator: Arc<Correlator>,
        transport: Arc<Transport>,
        span: tracing::Span,
    ) -> Self {
        let handle = tokio::spawn(run(lines, correlator, transport).instrument(span));
        Self { handle }
    }

    /// Stop reading. Outstanding requests are not resolved here; the caller
    /// closes the correlator.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for BackgroundReader {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(mut lines: LineReader, correlator: Arc<Correlator>, transport: Arc<Transport>) {
    loop {
        let line = match lines.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("peer closed its output");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "reading from peer failed");
                break;
            }
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        tracing::trace!(line = %String::from_utf8_lossy(&line), "received");

        let message = match framer::decode(&line).and_then(InboundMessage::try_from) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed line from peer");
                continue;
            }
        };

        dispatch(message, &correlator, &transport);
    }

    let outstanding = correlator.close_all();
    if outstanding > 0 {
        tracing::warn!(outstanding, "connection closed with requests in flight");
    } else {
        tracing::info!("connection closed");
    }
}

fn dispatch(message: InboundMessage, correlator: &Correlator, transport: &Arc<Transport>) {
    match message {
        InboundMessage::Response(response) => {
            correlator.deliver(response);
        }
        InboundMessage::Notification { method, .. } => {
            tracing::debug!(method = %method, "ignoring server notification");
        }
        InboundMessage::Request { id, method, .. } => {
            let reply = answer_server_request(id, &method);
            let transport = Arc::clone(transport);
            tokio::spawn(
                async move {
                    let line = match framer::encode(&reply) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!(error = %e, "cannot encode reply");
                            return;
                        }
                    };
                    if let Err(e) = transport.write_line(&line).await {
                        tracing::warn!(error = %e, "failed to answer server request");
                    }
                }
                .in_current_span(),
            );
        }
    }
}

/// We advertise no client capabilities, so `ping` is the only server request
/// we can serve.
fn answer_server_request(id: Value, method: &str) -> JsonRpcReply {
    if method == "ping" {
        tracing::debug!("answering server ping");
        JsonRpcReply::success(id, json!({}))
    } else {
        tracing::debug!(method = %method, "rejecting unsupported server request");
        JsonRpcReply::error(id, JsonRpcError::method_not_found(method))
    }
}
