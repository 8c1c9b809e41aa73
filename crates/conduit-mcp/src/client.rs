//! MCP client: manages one server connection.
//!
//! Handles the protocol handshake (initialize + initialized notification),
//! catalog discovery and caching (tools, resources, prompts), typed request
//! wrappers, and the `notifications/tools/list_changed` refresh.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::id::{GlobalIds, IdAllocator};
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest};
use crate::transport::{RequestContext, Transport, build_transport};
use crate::types::{
    CallToolResult, GetPromptResult, InitializeResult, ListPage, McpPrompt, McpResource, McpTool,
    PROTOCOL_VERSION, ReadResourceResult, ServerCapabilities, ServerInfo,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// Client name sent in `initialize`.
const CLIENT_NAME: &str = "conduit";

/// Upper bound on pages fetched by one `*/list` call.
const MAX_LIST_PAGES: usize = 100;

/// Builds a transport for an already-expanded server config.
pub type TransportFactory = Arc<dyn Fn(&McpServerConfig) -> Arc<dyn Transport> + Send + Sync>;

/// Called after the server reports a changed tool catalog, with the server
/// name and the tools cached after the refresh.
pub type ToolsChangedCallback = Arc<dyn Fn(&str, &[McpTool]) + Send + Sync>;

/// Client for a single MCP server.
///
/// Cheap to clone; clones share the connection and caches.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    config: McpServerConfig,
    ids: Arc<dyn IdAllocator>,
    factory: TransportFactory,
    state: RwLock<ClientState>,
    on_tools_changed: RwLock<Option<ToolsChangedCallback>>,
    /// Serializes connect/disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Everything a session knows about its server. Present transport means
/// connected.
#[derive(Default)]
struct ClientState {
    transport: Option<Arc<dyn Transport>>,
    init: Option<InitializeResult>,
    tools: Vec<McpTool>,
    resources: Vec<McpResource>,
    prompts: Vec<McpPrompt>,
}

/// Builder for clients that need a non-default ID source or transport.
pub struct McpClientBuilder {
    name: String,
    config: McpServerConfig,
    ids: Arc<dyn IdAllocator>,
    factory: TransportFactory,
}

impl McpClientBuilder {
    /// Use `ids` instead of the process-wide counter.
    pub fn id_allocator(mut self, ids: Arc<dyn IdAllocator>) -> Self {
        self.ids = ids;
        self
    }

    /// Build transports with `factory` instead of picking one from the
    /// config's transport kind.
    pub fn transport_factory(mut self, factory: TransportFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn build(self) -> McpClient {
        McpClient {
            inner: Arc::new(ClientInner {
                name: self.name,
                config: self.config,
                ids: self.ids,
                factory: self.factory,
                state: RwLock::new(ClientState::default()),
                on_tools_changed: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl McpClient {
    /// Create a disconnected client for `config`.
    pub fn new(name: impl Into<String>, config: McpServerConfig) -> Self {
        Self::builder(name, config).build()
    }

    pub fn builder(name: impl Into<String>, config: McpServerConfig) -> McpClientBuilder {
        McpClientBuilder {
            name: name.into(),
            config,
            ids: Arc::new(GlobalIds),
            factory: Arc::new(build_transport),
        }
    }

    /// Server name this client was created with.
    pub fn server_name(&self) -> &str {
        &self.inner.name
    }

    /// Connect: start the transport, run the handshake, warm the caches.
    ///
    /// A no-op when already connected. On failure the client stays fully
    /// disconnected and the transport is closed.
    pub async fn connect(&self, ctx: &RequestContext) -> Result<(), McpError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        // Resolve ${VAR} references now, not when the config was loaded.
        let config = inner.config.expanded();
        let transport = (inner.factory)(&config);
        let weak = Arc::downgrade(inner);
        transport.set_notification_handler(Arc::new(move |notification: JsonRpcNotification| {
            handle_notification(&weak, notification)
        }));

        let init = match inner.handshake(ctx, &transport).await {
            Ok(init) => init,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("Closing transport after failed connect: {close_err}");
                }
                return Err(e);
            }
        };

        tracing::info!(
            "MCP server '{}' connected ({} {}, protocol {})",
            inner.name,
            init.server_info.name,
            init.server_info.version,
            init.protocol_version
        );
        let capabilities = init.capabilities.clone();
        {
            let mut state = inner.write_state();
            *state = ClientState {
                transport: Some(transport),
                init: Some(init),
                ..ClientState::default()
            };
        }

        inner.prefetch(ctx, &capabilities).await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read_state().transport.is_some()
    }

    /// Result of the last successful `initialize`.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.inner.read_state().init.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner
            .read_state()
            .init
            .as_ref()
            .map(|init| init.server_info.clone())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .read_state()
            .init
            .as_ref()
            .map(|init| init.capabilities.clone())
    }

    /// Fetch the tool catalog and refresh the cache.
    pub async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<McpTool>, McpError> {
        self.inner.list_tools(ctx).await
    }

    /// Fetch the resource catalog and refresh the cache.
    pub async fn list_resources(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<McpResource>, McpError> {
        self.inner.list_resources(ctx).await
    }

    /// Fetch the prompt catalog and refresh the cache.
    pub async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<McpPrompt>, McpError> {
        self.inner.list_prompts(ctx).await
    }

    /// Tools from the last successful listing, without a round trip.
    pub fn cached_tools(&self) -> Vec<McpTool> {
        self.inner.read_state().tools.clone()
    }

    pub fn cached_resources(&self) -> Vec<McpResource> {
        self.inner.read_state().resources.clone()
    }

    pub fn cached_prompts(&self) -> Vec<McpPrompt> {
        self.inner.read_state().prompts.clone()
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        ctx: &RequestContext,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        self.inner.request_as(ctx, "tools/call", Some(params)).await
    }

    pub async fn read_resource(
        &self,
        ctx: &RequestContext,
        uri: &str,
    ) -> Result<ReadResourceResult, McpError> {
        let params = serde_json::json!({ "uri": uri });
        self.inner
            .request_as(ctx, "resources/read", Some(params))
            .await
    }

    pub async fn get_prompt(
        &self,
        ctx: &RequestContext,
        prompt_name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let params = serde_json::json!({
            "name": prompt_name,
            "arguments": arguments,
        });
        self.inner.request_as(ctx, "prompts/get", Some(params)).await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self, ctx: &RequestContext) -> Result<(), McpError> {
        self.inner.request(ctx, "ping", None).await.map(|_| ())
    }

    /// Register the callback run after a `tools/list_changed` refresh.
    /// Replaces any previous callback.
    pub fn on_tools_changed(&self, callback: ToolsChangedCallback) {
        *self
            .inner
            .on_tools_changed
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Close the transport and forget the session. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let transport = std::mem::take(&mut *self.inner.write_state()).transport;
        match transport {
            Some(transport) => {
                tracing::debug!("Disconnecting MCP server '{}'", self.inner.name);
                transport.close().await
            }
            None => Ok(()),
        }
    }

    /// Alias for [`McpClient::disconnect`].
    pub async fn close(&self) -> Result<(), McpError> {
        self.disconnect().await
    }
}

impl ClientInner {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ClientState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ClientState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn handshake(
        &self,
        ctx: &RequestContext,
        transport: &Arc<dyn Transport>,
    ) -> Result<InitializeResult, McpError> {
        transport.start(ctx).await?;

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self
            .send_on(transport, ctx, "initialize", Some(params))
            .await?;
        let init: InitializeResult = parse_result("initialize", result)?;
        if init.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                "MCP server '{}' answered with protocol {} (requested {PROTOCOL_VERSION})",
                self.name,
                init.protocol_version
            );
        }

        transport
            .send_notification(
                ctx,
                JsonRpcNotification::new("notifications/initialized", None),
            )
            .await?;
        Ok(init)
    }

    /// Best-effort cache warm-up for every declared capability.
    async fn prefetch(&self, ctx: &RequestContext, capabilities: &ServerCapabilities) {
        if capabilities.has_tools() {
            if let Err(e) = self.list_tools(ctx).await {
                tracing::warn!("MCP server '{}': tools/list prefetch failed: {e}", self.name);
            }
        }
        if capabilities.has_resources() {
            if let Err(e) = self.list_resources(ctx).await {
                tracing::warn!(
                    "MCP server '{}': resources/list prefetch failed: {e}",
                    self.name
                );
            }
        }
        if capabilities.has_prompts() {
            if let Err(e) = self.list_prompts(ctx).await {
                tracing::warn!(
                    "MCP server '{}': prompts/list prefetch failed: {e}",
                    self.name
                );
            }
        }
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<McpTool>, McpError> {
        let transport = self.current_transport()?;
        let tools: Vec<McpTool> = self.list_all(&transport, ctx, "tools/list").await?;
        tracing::debug!("MCP server '{}' lists {} tools", self.name, tools.len());
        self.store_if_current(&transport, |state| state.tools = tools.clone());
        Ok(tools)
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<McpResource>, McpError> {
        let transport = self.current_transport()?;
        let resources: Vec<McpResource> =
            self.list_all(&transport, ctx, "resources/list").await?;
        self.store_if_current(&transport, |state| state.resources = resources.clone());
        Ok(resources)
    }

    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<McpPrompt>, McpError> {
        let transport = self.current_transport()?;
        let prompts: Vec<McpPrompt> = self.list_all(&transport, ctx, "prompts/list").await?;
        self.store_if_current(&transport, |state| state.prompts = prompts.clone());
        Ok(prompts)
    }

    /// Apply `update` unless the session that produced it has since been
    /// disconnected or replaced.
    fn store_if_current(
        &self,
        source: &Arc<dyn Transport>,
        update: impl FnOnce(&mut ClientState),
    ) {
        let mut state = self.write_state();
        let current = state
            .transport
            .as_ref()
            .is_some_and(|transport| Arc::ptr_eq(transport, source));
        if current {
            update(&mut *state);
        } else {
            tracing::debug!(
                "MCP server '{}': dropping catalog from a closed session",
                self.name
            );
        }
    }

    /// Collect every page of a `*/list` method.
    async fn list_all<T: DeserializeOwned>(
        &self,
        transport: &Arc<dyn Transport>,
        ctx: &RequestContext,
        method: &str,
    ) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request_on(transport, ctx, method, params).await?;
            let page: ListPage<T> = parse_result(method, result)?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        tracing::warn!(
            "MCP server '{}': {method} still paginating after {MAX_LIST_PAGES} pages; truncating",
            self.name
        );
        Ok(items)
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        let result = self.request(ctx, method, params).await?;
        parse_result(method, result)
    }

    fn current_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        self.read_state()
            .transport
            .clone()
            .ok_or(McpError::NotConnected)
    }

    /// Send a request on the current connection.
    async fn request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let transport = self.current_transport()?;
        self.request_on(&transport, ctx, method, params).await
    }

    /// Send on `transport`. If the connection turns out to be dead the
    /// client drops it, so the next `connect` starts fresh.
    async fn request_on(
        &self,
        transport: &Arc<dyn Transport>,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let result = self.send_on(transport, ctx, method, params).await;
        if let Err(e) = &result {
            if e.is_connection_lost() || !transport.is_alive() {
                self.forget_transport(transport).await;
            }
        }
        result
    }

    async fn send_on(
        &self,
        transport: &Arc<dyn Transport>,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let request = JsonRpcRequest::new(self.ids.next_id(), method, params);
        transport.send(ctx, request).await?.into_result()
    }

    async fn forget_transport(&self, dead: &Arc<dyn Transport>) {
        let forgotten = {
            let mut state = self.write_state();
            match &state.transport {
                Some(current) if Arc::ptr_eq(current, dead) => {
                    state.transport = None;
                    true
                }
                _ => false,
            }
        };
        if forgotten {
            tracing::warn!("MCP server '{}' connection lost", self.name);
            if let Err(e) = dead.close().await {
                tracing::debug!("Closing dead transport: {e}");
            }
        }
    }

    async fn refresh_after_tools_changed(&self) {
        if let Err(e) = self.list_tools(&RequestContext::new()).await {
            tracing::warn!(
                "MCP server '{}': refreshing tools after list_changed failed: {e}",
                self.name
            );
        }
        let callback = self
            .on_tools_changed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            let tools = self.read_state().tools.clone();
            callback(&self.name, &tools);
        }
    }
}

/// Notification handler installed on every transport the client starts.
///
/// Runs on the transport's read loop, so anything that needs a round trip
/// is moved onto its own task.
fn handle_notification(inner: &Weak<ClientInner>, notification: JsonRpcNotification) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match notification.method.as_str() {
        "notifications/tools/list_changed" => {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { inner.refresh_after_tools_changed().await });
                }
                Err(_) => tracing::warn!(
                    "MCP server '{}' changed its tools outside a runtime; not refreshing",
                    inner.name
                ),
            }
        }
        other => tracing::debug!("MCP server '{}' sent '{other}'", inner.name),
    }
}

fn parse_result<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, McpError> {
    serde_json::from_value(result)
        .map_err(|e| McpError::Protocol(format!("Failed to parse {method} result: {e}")))
}
