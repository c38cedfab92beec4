//! Scripted in-memory MCP peer for driving a `Session` over `tokio::io::duplex`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use ultrathink_mcp_client::{ClientConfig, Session};

/// What the peer does after reading one message.
pub enum Reply {
    /// Write these messages, one per line.
    Send(Vec<Value>),
    /// Write these raw lines verbatim.
    Raw(Vec<String>),
    Silent,
    /// Stop reading but keep the stream open, so the client's writes back up.
    Stall,
    /// Close the stream.
    Hangup,
}

pub type ClientHalves = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Start a peer task. It returns every message it received once the client
/// closes the stream or the handler hangs up.
pub fn spawn_peer<F>(handler: F) -> (ClientHalves, JoinHandle<Vec<Value>>)
where
    F: FnMut(&Value) -> Reply + Send + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(serve(server, handler));
    (tokio::io::split(client), task)
}

async fn serve<F>(stream: DuplexStream, mut handler: F) -> Vec<Value>
where
    F: FnMut(&Value) -> Reply,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut seen = Vec::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = serde_json::from_str(&line).expect("client wrote invalid JSON");
        let reply = handler(&msg);
        seen.push(msg);

        let out: Vec<String> = match reply {
            Reply::Send(values) => values.iter().map(Value::to_string).collect(),
            Reply::Raw(lines) => lines,
            Reply::Silent => continue,
            Reply::Stall => {
                std::future::pending::<()>().await;
                continue;
            }
            Reply::Hangup => break,
        };
        for line in out {
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return seen;
            }
        }
        let _ = writer.flush().await;
    }
    seen
}

/// Answer each request (messages with an `id`) with the next scripted line,
/// ignoring notifications.
pub fn scripted(replies: Vec<Value>) -> impl FnMut(&Value) -> Reply + Send + 'static {
    let mut replies: VecDeque<Value> = replies.into();
    move |msg| {
        if msg.get("id").is_none() {
            return Reply::Silent;
        }
        match replies.pop_front() {
            Some(reply) => Reply::Send(vec![reply]),
            None => Reply::Silent,
        }
    }
}

pub fn method(msg: &Value) -> &str {
    msg["method"].as_str().unwrap_or_default()
}

pub fn result_for(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
}

pub fn error_for(request: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": code, "message": message}})
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_project("p")
        .with_request_timeout(Duration::from_secs(2))
}

/// A `Ready` session whose peer answers the handshake and hands every later
/// message to `handler`.
pub async fn connected<F>(config: ClientConfig, mut handler: F) -> (Session, JoinHandle<Vec<Value>>)
where
    F: FnMut(&Value) -> Reply + Send + 'static,
{
    let ((reader, writer), task) = spawn_peer(move |msg| match method(msg) {
        "initialize" => Reply::Send(vec![result_for(
            msg,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-peer", "version": "0.0.1"}
            }),
        )]),
        "notifications/initialized" => Reply::Silent,
        _ => handler(msg),
    });

    let mut session = Session::new(config);
    session
        .connect_with(reader, writer)
        .await
        .expect("handshake with fake peer");
    (session, task)
}
