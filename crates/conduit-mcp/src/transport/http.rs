//! Streamable HTTP transport.
//!
//! Every message is an HTTP POST to the configured URL. The reply is either
//! a plain `application/json` body or a `text/event-stream` carrying the
//! response, possibly preceded by server notifications. There is no
//! persistent socket; "alive" means the URL was accepted by `start` and the
//! transport has not been closed.
//!
//! The server may issue an `Mcp-Session-Id` header on any response. Once
//! seen, it is echoed on every later request and a DELETE ends the session
//! on close.

use super::{
    BoxFuture, HandlerSlot, NotificationHandler, RequestContext, Transport, deliver_notification,
    dispatch_notification,
};
use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{Inbound, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, classify};
use crate::retry::{RetryConfig, parse_retry_after};
use crate::sse::{SseEvent, SseParser};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode, Url};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Session header issued by Streamable HTTP servers.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Request timeout when neither the call nor the config sets one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the session-terminating DELETE sent from `close`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Streamable HTTP transport for a remote MCP server.
pub struct HttpTransport {
    config: McpServerConfig,
    http: reqwest::Client,
    retry: RetryConfig,
    endpoint: RwLock<Option<Url>>,
    session_id: RwLock<Option<String>>,
    handlers: HandlerSlot,
    alive: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl HttpTransport {
    /// Create a transport for `config`. The URL is validated in `start`.
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            retry: RetryConfig::default(),
            endpoint: RwLock::new(None),
            session_id: RwLock::new(None),
            handlers: HandlerSlot::default(),
            alive: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the backoff policy for HTTP 429 responses.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Session ID issued by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn endpoint(&self) -> Result<Url, McpError> {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(McpError::NotConnected)
    }

    fn capture_session(&self, response: &reqwest::Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return;
        };
        let mut slot = self.session_id.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_deref() != Some(id) {
            tracing::debug!("MCP session id set to {id}");
            *slot = Some(id.to_string());
        }
    }

    fn build_post(&self, url: &Url, body: &str) -> RequestBuilder {
        let mut req = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body.to_string());
        req = apply_headers(req, &self.config.headers);
        if let Some(id) = self.session_id() {
            req = req.header(SESSION_HEADER, id);
        }
        req
    }

    /// POST `body`, retrying on 429. The request is rebuilt for every
    /// attempt.
    ///
    /// The request deadline bounds each attempt on its own; backoff pauses
    /// between attempts do not count against it.
    async fn post(
        &self,
        ctx: &RequestContext,
        method: &str,
        body: &str,
    ) -> Result<reqwest::Response, McpError> {
        let url = self.endpoint()?;
        let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
        let mut attempt = 0;

        loop {
            tracing::debug!(
                "POST {url} (attempt {}/{})",
                attempt + 1,
                self.retry.max_attempts
            );
            let response = ctx
                .run(method, timeout, &self.shutdown, async {
                    self.build_post(&url, body)
                        .send()
                        .await
                        .map_err(|e| McpError::Network(e.to_string()))
                })
                .await?;
            self.capture_session(&response);

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt + 1 < self.retry.max_attempts {
                let delay = self
                    .retry
                    .delay_for(attempt, parse_retry_after(response.headers()));
                tracing::warn!(
                    "MCP server rate limited (attempt {}/{}); retrying in {}ms",
                    attempt + 1,
                    self.retry.max_attempts,
                    delay.as_millis()
                );
                drop(response);
                ctx.pause(delay, &self.shutdown).await?;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = ctx
                    .run(method, timeout, &self.shutdown, async {
                        Ok(response.text().await.unwrap_or_default())
                    })
                    .await?;
                return Err(McpError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(response);
        }
    }

    /// Decode the reply to request `id` according to its Content-Type.
    async fn read_response(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_stream {
            return self.scan_event_stream(response, id).await;
        }

        let body = response
            .text()
            .await
            .map_err(|e| McpError::Network(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(McpError::Protocol(format!(
                "empty response body for request {id}"
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Read SSE events until one carries the response to `id`. Everything
    /// else on the stream is dispatched as a notification.
    async fn scan_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| McpError::Network(e.to_string()))?;
            for event in parser.feed_bytes(&bytes) {
                if let Some(resp) = self.match_event(&event, id) {
                    return Ok(resp);
                }
            }
        }

        match parser.finish().and_then(|event| self.match_event(&event, id)) {
            Some(resp) => Ok(resp),
            None => Err(McpError::StreamEnded),
        }
    }

    fn match_event(&self, event: &SseEvent, id: u64) -> Option<JsonRpcResponse> {
        match classify(&event.data) {
            Ok(Inbound::Response(resp)) if resp.id == Some(id) => Some(resp),
            Ok(Inbound::Notification(notification)) => {
                deliver_notification(notification, &self.handlers);
                None
            }
            _ => {
                dispatch_notification(&event.data, &self.handlers);
                None
            }
        }
    }

    async fn end_session(&self) {
        let (Some(session), Ok(url)) = (self.session_id(), self.endpoint()) else {
            return;
        };
        let req = apply_headers(self.http.delete(url), &self.config.headers)
            .header(SESSION_HEADER, session)
            .timeout(CLOSE_TIMEOUT);
        if let Err(e) = req.send().await {
            tracing::debug!("MCP session DELETE failed: {e}");
        }
    }
}

impl Transport for HttpTransport {
    fn start<'a>(&'a self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            let url = parse_url(&self.config.url, "http")?;
            *self.endpoint.write().unwrap_or_else(|e| e.into_inner()) = Some(url);
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        ctx: &'a RequestContext,
        request: JsonRpcRequest,
    ) -> BoxFuture<'a, Result<JsonRpcResponse, McpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(McpError::NotConnected);
            }
            let body = serde_json::to_string(&request)?;
            tracing::debug!("-> {} (id {})", request.method, request.id);

            let response = self.post(ctx, &request.method, &body).await?;
            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run(
                &request.method,
                timeout,
                &self.shutdown,
                self.read_response(response, request.id),
            )
            .await
        })
    }

    fn send_notification<'a>(
        &'a self,
        ctx: &'a RequestContext,
        notification: JsonRpcNotification,
    ) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(McpError::NotConnected);
            }
            let body = serde_json::to_string(&notification)?;
            // Body is usually empty (202 Accepted); nothing to read
            self.post(ctx, &notification.method, &body).await.map(drop)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.alive.store(false, Ordering::SeqCst);
            self.shutdown.cancel();
            self.end_session().await;
            Ok(())
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        self.handlers.set(handler);
    }
}

/// Parse a configured server URL, rejecting empty and non-HTTP ones.
pub(super) fn parse_url(raw: &str, transport: &str) -> Result<Url, McpError> {
    if raw.trim().is_empty() {
        return Err(McpError::Config(format!(
            "{transport} transport requires a url"
        )));
    }
    let url = Url::parse(raw.trim())
        .map_err(|e| McpError::Config(format!("invalid server url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(McpError::Config(format!(
            "unsupported url scheme '{}' in '{raw}'",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Add the configured custom headers to a request.
pub(super) fn apply_headers(
    mut req: RequestBuilder,
    headers: &HashMap<String, String>,
) -> RequestBuilder {
    for (name, value) in headers {
        req = req.header(name.as_str(), value.as_str());
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_rejects_missing_and_bad_urls() {
        assert!(matches!(parse_url("", "http"), Err(McpError::Config(_))));
        assert!(matches!(
            parse_url("not a url", "http"),
            Err(McpError::Config(_))
        ));
        assert!(matches!(
            parse_url("ftp://example.com", "http"),
            Err(McpError::Config(_))
        ));
        assert_eq!(
            parse_url(" http://localhost:3000/mcp ", "http")
                .unwrap()
                .as_str(),
            "http://localhost:3000/mcp"
        );
    }

    #[tokio::test]
    async fn start_requires_url() {
        let transport = HttpTransport::new(McpServerConfig::http(""));
        let result = transport.start(&RequestContext::new()).await;
        assert!(matches!(result, Err(McpError::Config(_))));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn start_marks_alive_without_network() {
        let transport = HttpTransport::new(McpServerConfig::http("http://127.0.0.1:1/mcp"));
        transport.start(&RequestContext::new()).await.unwrap();
        assert!(transport.is_alive());
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn send_before_start_is_not_connected() {
        let transport = HttpTransport::new(McpServerConfig::http("http://127.0.0.1:1/mcp"));
        let result = transport
            .send(&RequestContext::new(), JsonRpcRequest::new(1, "ping", None))
            .await;
        assert!(matches!(result, Err(McpError::NotConnected)));
    }

    #[tokio::test]
    async fn close_twice_then_send_fails_fast() {
        let transport = HttpTransport::new(McpServerConfig::http("http://127.0.0.1:1/mcp"));
        transport.start(&RequestContext::new()).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_alive());

        let result = transport
            .send(&RequestContext::new(), JsonRpcRequest::new(2, "ping", None))
            .await;
        assert!(matches!(result, Err(McpError::NotConnected)));
        let result = transport.start(&RequestContext::new()).await;
        assert!(matches!(result, Err(McpError::ConnectionClosed)));
    }
}
