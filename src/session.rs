//! Connection lifecycle and the RPC surface used by callers.

use std::fmt;
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::framer;
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsParams,
    ListToolsResult, MemoryRecord, ToolCallParams, ToolDescriptor,
};
use crate::reader::BackgroundReader;
use crate::transport::{LineReader, Transport};

pub const REMEMBER_TOOL: &str = "ultrathink_remember";
pub const RETRIEVE_TOOL: &str = "ultrathink_retrieve";
pub const SEQUENCE_TOOL: &str = "ultrathink_sequence";
pub const GRAPH_SYNC_TOOL: &str = "ultrathink_graphiti_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Initializing,
    Ready,
    Closed,
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` admit nothing but inspection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Priority attached to a stored memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority {other:?} (expected low, medium or high)")),
        }
    }
}

/// Direction of a knowledge-graph sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ToGraphiti,
    FromGraphiti,
    Bidirectional,
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_graphiti" => Ok(Self::ToGraphiti),
            "from_graphiti" => Ok(Self::FromGraphiti),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(format!(
                "unknown direction {other:?} (expected to_graphiti, from_graphiti or bidirectional)"
            )),
        }
    }
}

/// Everything that exists only while connected.
#[derive(Debug)]
struct Connection {
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    reader: BackgroundReader,
}

impl Connection {
    /// Send one request and wait for its response. `timeout` bounds the
    /// write and the wait together.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ClientError> {
        let deadline = Instant::now() + timeout;
        let id = self.correlator.allocate();
        let line = framer::encode(&JsonRpcRequest::new(id, method, params))?;
        let pending = self.correlator.register(id, method)?;

        tracing::trace!(id, method, line = %String::from_utf8_lossy(&line), "sending");
        match tokio::time::timeout_at(deadline, self.transport.write_line(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.correlator.abandon(id);
                return Err(e);
            }
            Err(_) => {
                // A partial line may be on the wire; nothing more can be sent.
                tracing::warn!(id, method, "peer stopped reading, closing connection");
                self.correlator.abandon(id);
                self.correlator.close_all();
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    id,
                    timeout,
                });
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.correlator
            .wait(pending, remaining)
            .await
            .map_err(|e| match e {
                ClientError::Timeout { method, id, .. } => ClientError::Timeout {
                    method,
                    id,
                    timeout,
                },
                other => other,
            })
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let line = framer::encode(&JsonRpcRequest::notification(method, params))?;
        tracing::trace!(method, "sending notification");
        match tokio::time::timeout(timeout, self.transport.write_line(&line)).await {
            Ok(written) => written,
            Err(_) => {
                self.correlator.close_all();
                Err(ClientError::transport(format!(
                    "peer did not accept {method} within {timeout:?}"
                )))
            }
        }
    }
}

/// One connection to one MCP peer.
///
/// `connect` and `disconnect` need exclusive access; the RPC operations take
/// `&self` and may run concurrently.
#[derive(Debug)]
pub struct Session {
    config: ClientConfig,
    state: Mutex<SessionState>,
    connection: Option<Connection>,
    server: Option<InitializeResult>,
    span: tracing::Span,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        let span = tracing::info_span!(
            "mcp_session",
            server = %config.server_name,
            project = %config.project
        );
        Self {
            config,
            state: Mutex::new(SessionState::Unstarted),
            connection: None,
            server: None,
            span,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. A connection the peer has closed reads as `Closed`.
    pub fn state(&self) -> SessionState {
        let mut state = self.lock_state();
        if matches!(*state, SessionState::Initializing | SessionState::Ready)
            && self
                .connection
                .as_ref()
                .is_some_and(|c| c.correlator.is_closed())
        {
            tracing::info!(parent: &self.span, from = %*state, "peer closed the connection");
            *state = SessionState::Closed;
        }
        *state
    }

    fn set_state(&self, to: SessionState) {
        let mut state = self.lock_state();
        if *state != to {
            tracing::debug!(parent: &self.span, from = %*state, to = %to, "session state change");
            *state = to;
        }
    }

    /// What the peer reported about itself during the handshake.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Requests sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |c| c.correlator.pending_count())
    }

    /// Spawn the configured peer and perform the handshake.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.expect_unstarted()?;

        let spec = self.config.launch_spec();
        let spawned = {
            let _entered = self.span.enter();
            Transport::spawn(&spec, self.config.shutdown_grace)
        };

        match spawned {
            Ok((transport, lines)) => self.establish(transport, lines).await,
            Err(e) => {
                tracing::error!(parent: &self.span, error = %e, "cannot start peer");
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Handshake over an already-open byte stream instead of a child process.
    pub async fn connect_with<R, W>(&mut self, reader: R, writer: W) -> Result<(), ClientError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.expect_unstarted()?;
        let (transport, lines) = Transport::from_stream(reader, writer);
        self.establish(transport, lines).await
    }

    fn expect_unstarted(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Unstarted => Ok(()),
            state => Err(ClientError::NotReady { state }),
        }
    }

    async fn establish(&mut self, transport: Transport, lines: LineReader) -> Result<(), ClientError> {
        self.set_state(SessionState::Initializing);

        let transport = Arc::new(transport);
        let correlator = Arc::new(Correlator::new(self.config.quirk_compensation));
        let reader = BackgroundReader::spawn(
            lines,
            Arc::clone(&correlator),
            Arc::clone(&transport),
            self.span.clone(),
        );
        self.connection = Some(Connection {
            transport,
            correlator,
            reader,
        });

        let span = self.span.clone();
        match self.handshake().instrument(span).await {
            Ok(result) => {
                let info = result.server_info.clone().unwrap_or_default();
                tracing::info!(
                    parent: &self.span,
                    server_name = info.name.as_deref().unwrap_or("unknown"),
                    server_version = info.version.as_deref().unwrap_or("unknown"),
                    protocol = result.protocol_version.as_deref().unwrap_or("unknown"),
                    "handshake complete"
                );
                self.server = Some(result);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "handshake failed");
                self.set_state(SessionState::Failed);
                if let Err(release_err) = self.release().await {
                    tracing::warn!(parent: &self.span, error = %release_err, "cleanup after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, ClientError> {
        let conn = self.connection.as_ref().ok_or(ClientError::NotReady {
            state: SessionState::Initializing,
        })?;

        let params = serde_json::to_value(InitializeParams::new(self.config.client_info()))?;
        let response = conn
            .request("initialize", Some(params), self.config.request_timeout)
            .await?;

        let result = response
            .into_result()
            .map_err(|err| ClientError::Handshake {
                code: err.code,
                message: err.message,
                data: err.data,
            })?;

        let init = serde_json::from_value::<InitializeResult>(result).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unreadable initialize result, continuing without server info");
            InitializeResult::default()
        });

        conn.notify("notifications/initialized", None, self.config.request_timeout)
            .await?;
        Ok(init)
    }

    /// Close the connection: stop reading, fail outstanding requests,
    /// terminate the peer and wait for it.
    ///
    /// Idempotent and terminal: an unstarted session cannot be connected
    /// afterwards. After a failed `connect` there is nothing left to release
    /// and this returns `Ok(None)`.
    pub async fn disconnect(&mut self) -> Result<Option<ExitStatus>, ClientError> {
        if matches!(
            *self.lock_state(),
            SessionState::Unstarted | SessionState::Initializing | SessionState::Ready
        ) {
            self.set_state(SessionState::Closed);
        }
        self.release().await
    }

    async fn release(&mut self) -> Result<Option<ExitStatus>, ClientError> {
        let Some(conn) = self.connection.take() else {
            return Ok(None);
        };

        conn.reader.abort();
        let outstanding = conn.correlator.close_all();
        if outstanding > 0 {
            tracing::info!(parent: &self.span, outstanding, "abandoning in-flight requests");
        }

        let status = conn.transport.terminate().instrument(self.span.clone()).await;
        tracing::info!(parent: &self.span, "disconnected");
        status
    }

    fn ready_connection(&self) -> Result<&Connection, ClientError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(ClientError::NotReady { state });
        }
        self.connection
            .as_ref()
            .ok_or(ClientError::NotReady { state })
    }

    /// Send one request and wait for its response, in state `Ready` only.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ClientError> {
        let conn = self.ready_connection()?;
        let result = conn
            .request(method, params, self.config.request_timeout)
            .instrument(self.span.clone())
            .await;

        if let Err(e) = &result {
            if matches!(e, ClientError::Transport { .. }) || conn.correlator.is_closed() {
                tracing::error!(parent: &self.span, error = %e, "connection unusable, closing session");
                conn.correlator.close_all();
                self.set_state(SessionState::Closed);
            }
        }
        result
    }

    /// All tools the peer advertises, following pagination.
    ///
    /// An error response from the peer means "capability unknown" and yields
    /// an empty list; tools can still be called directly.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => Some(serde_json::to_value(ListToolsParams { cursor: c.clone() })?),
                None => None,
            };

            let response = self.request("tools/list", params).await?;
            let result = match response.into_result() {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(
                        parent: &self.span,
                        code = err.code,
                        message = %err.message,
                        "tools/list failed, treating tool set as unknown"
                    );
                    return Ok(Vec::new());
                }
            };

            let page: ListToolsResult = match serde_json::from_value(result) {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(parent: &self.span, error = %e, "unreadable tools/list result");
                    return Ok(Vec::new());
                }
            };
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Invoke a tool and return its `result` verbatim.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ClientError> {
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        let response = self.request("tools/call", Some(params)).await?;
        response.into_result().map_err(|err| ClientError::ToolCall {
            name: name.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        })
    }

    /// Liveness check; any result counts as success.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.request("ping", None).await?;
        response
            .into_result()
            .map(|_| ())
            .map_err(|err| ClientError::Rpc {
                method: "ping".into(),
                code: err.code,
                message: err.message,
                data: err.data,
            })
    }

    /// Store a memory in the session's project.
    pub async fn remember(
        &self,
        content: &str,
        priority: Priority,
        tags: &[String],
    ) -> Result<Value, ClientError> {
        self.call_tool(
            REMEMBER_TOOL,
            json!({
                "content": content,
                "project": self.config.project,
                "priority": priority,
                "tags": tags,
            }),
        )
        .await
    }

    /// Memories matching `query`. A result without `memories` is empty.
    pub async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryRecord>, ClientError> {
        let result = self
            .call_tool(
                RETRIEVE_TOOL,
                json!({
                    "query": query,
                    "project": self.config.project,
                    "limit": limit,
                }),
            )
            .await?;

        match result.get("memories") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(memories) => serde_json::from_value(memories.clone()).map_err(|e| {
                ClientError::UnexpectedResult {
                    method: RETRIEVE_TOOL.into(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    /// Record one step of a sequential-thinking chain.
    pub async fn sequence(&self, thought: &str, context: Option<&str>) -> Result<Value, ClientError> {
        self.call_tool(
            SEQUENCE_TOOL,
            json!({
                "thought": thought,
                "context": context,
                "project": self.config.project,
            }),
        )
        .await
    }

    /// Sync the project's memories with the knowledge graph.
    pub async fn sync_graph(&self, direction: Option<SyncDirection>) -> Result<Value, ClientError> {
        let mut arguments = json!({ "project": self.config.project });
        if let Some(direction) = direction {
            arguments["direction"] = json!(direction);
        }
        self.call_tool(GRAPH_SYNC_TOOL, arguments).await
    }
}
