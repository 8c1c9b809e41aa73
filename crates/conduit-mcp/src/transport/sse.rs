//! Legacy HTTP+SSE transport.
//!
//! One long-lived GET to `<base>/sse` carries everything the server sends;
//! each outbound message is a separate POST to `<base>/message`. A POST only
//! acknowledges receipt, the JSON-RPC response arrives later on the stream
//! and is matched to its caller through the pending table.
//!
//! Servers that announce an `endpoint` event get their POSTs sent to the
//! announced URL instead.

use super::http::{apply_headers, parse_url};
use super::pending::wait_for;
use super::{
    BoxFuture, HandlerSlot, NotificationHandler, PendingRequests, RequestContext, Transport,
    route_inbound,
};
use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::{SseEvent, SseParser};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Request timeout when neither the call nor the config sets one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `close` waits for the read loop to finish.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Legacy SSE transport for a remote MCP server.
pub struct SseTransport {
    config: McpServerConfig,
    http: reqwest::Client,
    message_url: Arc<RwLock<Option<Url>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pending: PendingRequests,
    handlers: HandlerSlot,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl SseTransport {
    /// Create a transport for `config`. Nothing is connected until `start`.
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            message_url: Arc::new(RwLock::new(None)),
            reader: Mutex::new(None),
            pending: PendingRequests::new(),
            handlers: HandlerSlot::default(),
            alive: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// URL outbound messages are currently POSTed to.
    pub fn message_url(&self) -> Option<Url> {
        self.message_url
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn connect(&self) -> Result<(), McpError> {
        let base = base_url(&self.config.url)?;
        let sse_url = join(&base, "sse")?;
        *self.message_url.write().unwrap_or_else(|e| e.into_inner()) =
            Some(join(&base, "message")?);

        tracing::debug!("GET {sse_url}");
        let response = apply_headers(self.http.get(sse_url), &self.config.headers)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        self.alive.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(
            response.bytes_stream(),
            ReadLoop {
                base,
                message_url: Arc::clone(&self.message_url),
                pending: self.pending.clone(),
                handlers: self.handlers.clone(),
                alive: Arc::clone(&self.alive),
                shutdown: self.shutdown.clone(),
            },
        ));
        *self.reader.lock().await = Some(reader);
        Ok(())
    }

    /// POST one message. Success only means the server accepted it.
    async fn post(&self, body: String) -> Result<(), McpError> {
        let url = self.message_url().ok_or(McpError::NotConnected)?;
        let response = apply_headers(self.http.post(url), &self.config.headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| McpError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl Transport for SseTransport {
    fn start<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            if self.is_alive() {
                return Ok(());
            }
            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run("sse/connect", timeout, &self.shutdown, self.connect())
                .await
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
            let (_guard, rx) = self.pending.register(request.id);
            tracing::debug!("-> {} (id {})", request.method, request.id);

            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run(&request.method, timeout, &self.shutdown, async {
                self.post(body).await?;
                wait_for(rx).await
            })
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
            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run(&notification.method, timeout, &self.shutdown, self.post(body))
                .await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.alive.store(false, Ordering::SeqCst);
            self.shutdown.cancel();

            if let Some(mut reader) = self.reader.lock().await.take() {
                if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                    tracing::warn!("SSE read loop did not stop in time; aborting");
                    reader.abort();
                }
            }
            self.pending.fail_all(|| McpError::ConnectionClosed);
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

/// State shared between the transport and its read loop.
struct ReadLoop {
    base: Url,
    message_url: Arc<RwLock<Option<Url>>>,
    pending: PendingRequests,
    handlers: HandlerSlot,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ReadLoop {
    fn handle_event(&self, event: SseEvent) {
        match event.event_type.as_deref() {
            Some("endpoint") => match self.base.join(event.data.trim()) {
                Ok(url) => {
                    tracing::debug!("SSE server announced message endpoint {url}");
                    *self.message_url.write().unwrap_or_else(|e| e.into_inner()) = Some(url);
                }
                Err(e) => tracing::warn!("Ignoring bad SSE endpoint '{}': {e}", event.data),
            },
            _ => route_inbound(&event.data, &self.pending, &self.handlers),
        }
    }
}

/// Consume the SSE stream until it ends, errors, or shutdown is requested.
/// However it ends, the transport is marked dead and every waiting caller
/// is failed.
async fn read_loop(
    stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    state: ReadLoop,
) {
    let mut stream = Box::pin(stream);
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.feed_bytes(&bytes) {
                    state.handle_event(event);
                }
            }
            Some(Err(e)) => {
                tracing::warn!("SSE stream error: {e}");
                break;
            }
            None => {
                tracing::debug!("SSE stream ended");
                if let Some(event) = parser.finish() {
                    state.handle_event(event);
                }
                break;
            }
        }
    }

    state.alive.store(false, Ordering::SeqCst);
    state.pending.fail_all(|| McpError::ConnectionClosed);
}

/// Base URL for the `sse`/`message` endpoints. A configured URL that already
/// points at `.../sse` is treated as its parent.
fn base_url(raw: &str) -> Result<Url, McpError> {
    let mut url = parse_url(raw, "sse")?;
    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/sse").unwrap_or(path).to_string();
    url.set_path(&format!("{path}/"));
    url.set_query(None);
    Ok(url)
}

fn join(base: &Url, segment: &str) -> Result<Url, McpError> {
    base.join(segment)
        .map_err(|e| McpError::Config(format!("cannot build '{segment}' url from {base}: {e}")))
}
