//! Stdio transport for MCP server communication.
//!
//! Spawns the server as a child process in its own process group and speaks
//! newline-delimited JSON-RPC over its stdin/stdout. Stderr stays attached to
//! ours for diagnostics.

use super::pending::wait_for;
use super::{
    BoxFuture, HandlerSlot, NotificationHandler, PendingRequests, RequestContext, Transport,
    route_inbound,
};
use crate::config::McpServerConfig;
use crate::env::merged_env;
use crate::error::McpError;
use crate::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use bytes::BytesMut;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Longest stdout line accepted from a server.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Request timeout when neither the call nor the config sets one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for the read loop after closing stdin.
const READER_GRACE: Duration = Duration::from_secs(2);

/// How long the process gets to exit after SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the kernel to reap the process after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct Process {
    child: Child,
    reader: JoinHandle<()>,
}

/// Async stdio transport for communicating with an MCP server process.
pub struct StdioTransport {
    config: McpServerConfig,
    process: Mutex<Option<Process>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingRequests,
    handlers: HandlerSlot,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a transport for `config`. Nothing is spawned until `start`.
    ///
    /// `config` is used verbatim; `${VAR}` references should already be
    /// expanded.
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: PendingRequests::new(),
            handlers: HandlerSlot::default(),
            alive: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn spawn(&self) -> Result<(), McpError> {
        if self.config.command.is_empty() {
            return Err(McpError::Config("stdio transport requires a command".into()));
        }

        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(merged_env(&self.config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            command: self.config.command.clone(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child stdout unavailable after spawn".into()))?;

        tracing::debug!(
            "Spawned MCP server '{}' (pid {:?})",
            self.config.command,
            child.id()
        );

        *self.stdin.lock().await = Some(stdin);
        self.alive.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(read_loop(
            stdout,
            self.pending.clone(),
            self.handlers.clone(),
            Arc::clone(&self.alive),
        ));

        *process = Some(Process { child, reader });
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(McpError::NotConnected)?;

        let result = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await
        }
        .await;

        if let Err(e) = result {
            let err = McpError::Io(e);
            if err.is_connection_lost() {
                tracing::warn!("MCP server '{}' stdin closed: {err}", self.config.command);
                stdin.take();
                self.mark_dead();
            }
            return Err(err);
        }
        Ok(())
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.pending.fail_all(|| McpError::ConnectionClosed);
    }

    async fn terminate(&self) {
        // Cooperative shutdown first: EOF on stdin
        drop(self.stdin.lock().await.take());

        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };

        if tokio::time::timeout(READER_GRACE, &mut process.reader)
            .await
            .is_err()
        {
            tracing::debug!("MCP read loop still running after stdin close");
        }

        if !matches!(process.child.try_wait(), Ok(Some(_))) {
            signal_terminate(&mut process.child);
            if tokio::time::timeout(TERM_GRACE, process.child.wait())
                .await
                .is_err()
            {
                tracing::warn!(
                    "MCP server '{}' ignored SIGTERM for {}s; killing",
                    self.config.command,
                    TERM_GRACE.as_secs()
                );
                signal_kill(&mut process.child);
                if tokio::time::timeout(KILL_GRACE, process.child.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!("MCP server '{}' not reaped after kill", self.config.command);
                }
            }
        }

        process.reader.abort();
    }
}

impl Transport for StdioTransport {
    fn start<'a>(&'a self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            self.spawn().await
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

            let line = serde_json::to_string(&request)?;
            let (_guard, rx) = self.pending.register(request.id);
            tracing::debug!("-> {} (id {})", request.method, request.id);

            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run(&request.method, timeout, &self.shutdown, async {
                self.write_line(&line).await?;
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
            let line = serde_json::to_string(&notification)?;
            let timeout = self.config.timeout_or(DEFAULT_TIMEOUT);
            ctx.run(
                &notification.method,
                timeout,
                &self.shutdown,
                self.write_line(&line),
            )
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
            self.terminate().await;
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

/// Read stdout line by line until EOF, routing each line. On exit the
/// transport is marked dead and every waiting caller is failed.
async fn read_loop(
    mut stdout: ChildStdout,
    pending: PendingRequests,
    handlers: HandlerSlot,
    alive: Arc<AtomicBool>,
) {
    let mut codec = LinesCodec::new_with_max_length(MAX_LINE_BYTES);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut eof = false;

    while !eof {
        match stdout.read_buf(&mut buf).await {
            Ok(0) => eof = true,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Error reading MCP server stdout: {e}");
                break;
            }
        }

        loop {
            let decoded = if eof {
                codec.decode_eof(&mut buf)
            } else {
                codec.decode(&mut buf)
            };
            match decoded {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        route_inbound(line, &pending, &handlers);
                    }
                }
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("Discarding MCP message longer than {MAX_LINE_BYTES} bytes");
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::warn!("Discarding undecodable MCP line: {e}");
                }
            }
        }
    }

    tracing::debug!("MCP server stdout closed");
    alive.store(false, Ordering::SeqCst);
    pending.fail_all(|| McpError::ConnectionClosed);
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // SAFETY: the child was spawned with process_group(0), so its pid is
        // also its process group id; a negative pid addresses the group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    }
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn signal_kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_kill(child: &mut Child) {
    let _ = child.start_kill();
}
