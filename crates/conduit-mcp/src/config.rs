//! Configuration types for MCP servers.

use crate::env::{expand_env, expand_env_map, expand_env_slice};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Which binding carries JSON-RPC to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON over stdin/stdout.
    #[default]
    Stdio,
    /// Streamable HTTP: one POST per message.
    Http,
    /// Legacy SSE: GET `<base>/sse` inbound, POST `<base>/message` outbound.
    Sse,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to run (e.g., "npx", "python"). Stdio only.
    #[serde(default)]
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables layered over the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Server URL. HTTP and SSE only.
    #[serde(default)]
    pub url: String,
    /// Extra headers sent with every HTTP request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Default request timeout in milliseconds. Falls back to a per-transport
    /// default when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl McpServerConfig {
    /// Stdio server config.
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Stdio,
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    /// Streamable HTTP server config.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            url: url.into(),
            ..Self::default()
        }
    }

    /// Legacy SSE server config.
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Sse,
            url: url.into(),
            ..Self::default()
        }
    }

    /// A copy with `${VAR}` references resolved in command, args, env values,
    /// url and header values.
    pub fn expanded(&self) -> Self {
        Self {
            transport: self.transport,
            command: expand_env(&self.command),
            args: expand_env_slice(&self.args),
            env: expand_env_map(&self.env),
            url: expand_env(&self.url),
            headers: expand_env_map(&self.headers),
            timeout_ms: self.timeout_ms,
        }
    }

    /// Configured timeout, or `fallback`.
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(fallback)
    }
}
