//! MCP client for line-delimited JSON-RPC 2.0 servers spoken over a child
//! process's stdio.
//!
//! A [`Session`] spawns `<executable> mcp <server>`, performs the
//! `initialize` handshake, and exposes `tools/list`, `tools/call` and the
//! memory tools built on top of them. Responses are matched to requests by
//! id in a background reader, so calls may overlap and time out
//! independently. Error responses that a defective peer sends with id `0`
//! are attributed to the most recent unanswered request (see [`quirk`]).

pub mod config;
pub mod correlator;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod quirk;
pub mod reader;
pub mod schema;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use error::ClientError;
pub use session::{Priority, Session, SessionState, SyncDirection};
