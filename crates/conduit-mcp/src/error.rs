//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid MCP server configuration: {0}")]
    Config(String),

    #[error("Failed to spawn MCP server '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("stream ended without response")]
    StreamEnded,

    #[error("MCP request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("MCP request cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Returns `true` when the error means the connection itself is gone,
    /// as opposed to a single request failing.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            McpError::NotConnected | McpError::ConnectionClosed => true,
            McpError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_variants() {
        assert!(McpError::NotConnected.is_connection_lost());
        assert!(McpError::ConnectionClosed.is_connection_lost());
        assert!(
            McpError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_connection_lost()
        );
    }

    #[test]
    fn request_level_errors_keep_connection() {
        assert!(!McpError::Cancelled.is_connection_lost());
        assert!(!McpError::StreamEnded.is_connection_lost());
        assert!(
            !McpError::Timeout {
                method: "ping".into(),
                timeout_ms: 10
            }
            .is_connection_lost()
        );
        assert!(
            !McpError::JsonRpc {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }
            .is_connection_lost()
        );
    }

    #[test]
    fn display_messages() {
        assert_eq!(McpError::NotConnected.to_string(), "not connected");
        assert_eq!(McpError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(
            McpError::StreamEnded.to_string(),
            "stream ended without response"
        );
    }
}
