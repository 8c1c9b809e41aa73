//! MCP manager: orchestrates multiple MCP server connections.

use crate::client::McpClient;
use crate::config::McpConfig;
use crate::transport::RequestContext;
use crate::types::McpTool;

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    clients: Vec<McpClient>,
}

impl McpManager {
    /// Connect to every configured server.
    ///
    /// Servers that fail to connect are logged and skipped; the manager
    /// carries on with whatever servers are available.
    pub async fn start(config: &McpConfig, ctx: &RequestContext) -> Self {
        let mut names: Vec<&String> = config.servers.keys().collect();
        names.sort();

        let mut clients = Vec::new();
        for name in names {
            let client = McpClient::new(name.clone(), config.servers[name].clone());
            match client.connect(ctx).await {
                Ok(()) => {
                    tracing::info!(
                        "MCP server '{}' started ({} tools)",
                        name,
                        client.cached_tools().len()
                    );
                    clients.push(client);
                }
                Err(e) => {
                    tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                }
            }
        }

        Self { clients }
    }

    /// Connected clients, ordered by server name.
    pub fn clients(&self) -> &[McpClient] {
        &self.clients
    }

    /// Client for the server called `name`.
    pub fn client(&self, name: &str) -> Option<&McpClient> {
        self.clients.iter().find(|c| c.server_name() == name)
    }

    /// Cached tools from all connected servers, paired with their client.
    pub fn tools(&self) -> Vec<(McpClient, McpTool)> {
        let mut all_tools = Vec::new();
        for client in &self.clients {
            for tool in client.cached_tools() {
                all_tools.push((client.clone(), tool));
            }
        }
        all_tools
    }

    /// Number of connected servers.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connected servers and their cached tool counts.
    pub fn server_summary(&self) -> Vec<(&str, usize)> {
        self.clients
            .iter()
            .map(|c| (c.server_name(), c.cached_tools().len()))
            .collect()
    }

    /// Disconnect every server.
    pub async fn shutdown(self) {
        for client in self.clients {
            if let Err(e) = client.disconnect().await {
                tracing::warn!(
                    "Error shutting down MCP server '{}': {e}",
                    client.server_name()
                );
            }
        }
    }
}
