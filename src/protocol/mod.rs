pub mod message;
pub mod request;
pub mod response;

pub use message::InboundMessage;
pub use request::{
    ClientInfo, InitializeParams, JsonRpcRequest, ListToolsParams, ToolCallParams,
    JSONRPC_VERSION, PROTOCOL_VERSION,
};
pub use response::{
    InitializeResult, JsonRpcError, JsonRpcReply, JsonRpcResponse, ListToolsResult, MemoryRecord,
    Outcome, ServerInfo, ToolDescriptor,
};
