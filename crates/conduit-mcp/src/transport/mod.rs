//! Transport contract shared by the stdio, HTTP and SSE bindings.
//!
//! A transport moves JSON-RPC requests and notifications to one server and
//! routes what comes back: responses to the caller that is waiting for them,
//! everything else to the registered notification handler.

mod http;
mod pending;
mod sse;
mod stdio;

pub use http::{HttpTransport, SESSION_HEADER};
pub use pending::{PendingGuard, PendingRequests};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

use crate::config::{McpServerConfig, TransportKind};
use crate::error::McpError;
use crate::jsonrpc::{Inbound, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, classify};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A boxed future, as returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked for every inbound notification.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Moves JSON-RPC messages between this client and one MCP server.
///
/// Dyn-compatible so the client can hold `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Acquire the underlying I/O resource (process, URL, stream).
    fn start<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), McpError>>;

    /// Send a request and wait for its response.
    ///
    /// Resolves exactly once: with the matching response, a timeout, a
    /// cancellation, or a connection error.
    fn send<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: JsonRpcRequest,
    ) -> BoxFuture<'a, Result<JsonRpcResponse, McpError>>;

    /// Send a notification. No response is expected.
    fn send_notification<'a>(
        &'a self,
        ctx: &'a RequestContext,
        notification: JsonRpcNotification,
    ) -> BoxFuture<'a, Result<(), McpError>>;

    /// Release every resource. Idempotent; in-flight sends fail instead of
    /// hanging.
    fn close(&self) -> BoxFuture<'_, Result<(), McpError>>;

    fn is_alive(&self) -> bool;

    /// Replace the notification handler. Takes effect for the next inbound
    /// message.
    fn set_notification_handler(&self, handler: NotificationHandler);
}

/// Build the transport matching `config.transport`. Nothing is started.
pub fn build_transport(config: &McpServerConfig) -> Arc<dyn Transport> {
    match config.transport {
        TransportKind::Stdio => Arc::new(StdioTransport::new(config.clone())),
        TransportKind::Http => Arc::new(HttpTransport::new(config.clone())),
        TransportKind::Sse => Arc::new(SseTransport::new(config.clone())),
    }
}

/// Deadline and cancellation for one operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive `fut` to completion unless the deadline passes, this context is
    /// cancelled, or `shutdown` fires first.
    pub async fn run<T, F>(
        &self,
        method: &str,
        default_timeout: Duration,
        shutdown: &CancellationToken,
        fut: F,
    ) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        let timeout = self.timeout.unwrap_or(default_timeout);
        tokio::select! {
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            _ = self.cancel.cancelled() => Err(McpError::Cancelled),
            _ = shutdown.cancelled() => Err(McpError::ConnectionClosed),
        }
    }

    /// Sleep for `delay` without a deadline. Cancellation and `shutdown`
    /// still cut it short.
    pub async fn pause(
        &self,
        delay: Duration,
        shutdown: &CancellationToken,
    ) -> Result<(), McpError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(McpError::Cancelled),
            _ = shutdown.cancelled() => Err(McpError::ConnectionClosed),
        }
    }
}

/// Shared, re-bindable notification handler slot.
///
/// Read once per inbound message, so a rebind is visible to the very next
/// message without re-subscribing.
#[derive(Clone, Default)]
pub struct HandlerSlot {
    inner: Arc<RwLock<Option<NotificationHandler>>>,
}

impl HandlerSlot {
    pub fn set(&self, handler: NotificationHandler) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    pub fn get(&self) -> Option<NotificationHandler> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Route `raw` to the notification handler if it carries a `method`.
///
/// Returns `true` when the message was a notification (whether or not a
/// handler was registered). Anything else is logged and left to the caller.
pub fn dispatch_notification(raw: &str, handlers: &HandlerSlot) -> bool {
    match classify(raw) {
        Ok(Inbound::Notification(notification)) => {
            deliver_notification(notification, handlers);
            true
        }
        Ok(Inbound::Response(resp)) => {
            tracing::debug!("Ignoring response with no waiting caller (id {:?})", resp.id);
            false
        }
        Ok(Inbound::Unrecognized(_)) => {
            tracing::debug!("Ignoring unrecognized MCP message: {raw}");
            false
        }
        Err(e) => {
            tracing::warn!("Failed to parse MCP message: {e}: {raw}");
            false
        }
    }
}

/// Hand an already-parsed notification to the current handler.
pub(crate) fn deliver_notification(notification: JsonRpcNotification, handlers: &HandlerSlot) {
    match handlers.get() {
        Some(handler) => handler(notification),
        None => tracing::debug!(
            "No notification handler registered; dropping '{}'",
            notification.method
        ),
    }
}

/// Route one inbound message from a read loop: responses to their waiting
/// caller, notifications to the handler, everything else to the log.
pub(crate) fn route_inbound(raw: &str, pending: &PendingRequests, handlers: &HandlerSlot) {
    match classify(raw) {
        Ok(Inbound::Response(resp)) => {
            if let Err(resp) = pending.deliver(resp) {
                tracing::warn!("Received MCP response for unknown request id {:?}", resp.id);
                dispatch_notification(raw, handlers);
            }
        }
        Ok(Inbound::Notification(notification)) => deliver_notification(notification, handlers),
        Ok(Inbound::Unrecognized(_)) | Err(_) => {
            dispatch_notification(raw, handlers);
        }
    }
}
