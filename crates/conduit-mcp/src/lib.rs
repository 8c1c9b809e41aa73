//! Model Context Protocol (MCP) client.
//!
//! Speaks JSON-RPC 2.0 to MCP servers over three bindings: a child process
//! on stdin/stdout, Streamable HTTP, and the legacy HTTP+SSE pair. A
//! [`McpClient`] owns one connection, runs the handshake, caches the
//! server's tool/resource/prompt catalog and exposes typed calls;
//! [`McpManager`] runs a client per configured server.

pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod id;
pub mod jsonrpc;
pub mod manager;
pub mod retry;
pub mod sse;
pub mod transport;
pub mod types;

pub use client::{McpClient, McpClientBuilder, ToolsChangedCallback, TransportFactory};
pub use config::{McpConfig, McpServerConfig, TransportKind};
pub use error::McpError;
pub use id::{GlobalIds, IdAllocator, SequentialIds};
pub use manager::McpManager;
pub use transport::{
    HttpTransport, NotificationHandler, RequestContext, SseTransport, StdioTransport, Transport,
};
pub use types::{
    CallToolResult, GetPromptResult, InitializeResult, McpPrompt, McpResource, McpTool,
    ReadResourceResult, ToolContent,
};
