//! Pending-request table: request ID -> one-shot completion.
//!
//! Every removal (delivery, cancellation, teardown) happens under the same
//! lock as the lookup, so an entry is resolved at most once.

use crate::error::McpError;
use crate::jsonrpc::JsonRpcResponse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// Outstanding requests for one connection.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, Completion>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Completion>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` before the request is written. The returned guard
    /// removes the entry when dropped, whichever way the caller exits.
    pub fn register(
        &self,
        id: u64,
    ) -> (
        PendingGuard,
        oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(id, tx).is_some() {
            tracing::warn!("Request id {id} registered while already pending");
        }
        let guard = PendingGuard {
            id,
            pending: self.clone(),
        };
        (guard, rx)
    }

    /// Deliver a response to its waiting caller. Hands the response back
    /// when nobody is waiting for its id.
    pub fn deliver(&self, response: JsonRpcResponse) -> Result<(), JsonRpcResponse> {
        let Some(id) = response.id else {
            return Err(response);
        };
        let Some(tx) = self.lock().remove(&id) else {
            return Err(response);
        };
        // The receiver may have just timed out; nothing left to do then
        let _ = tx.send(Ok(response));
        Ok(())
    }

    /// Remove `id` without resolving it.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every outstanding request. Used when the connection goes away.
    pub fn fail_all(&self, make_error: impl Fn() -> McpError) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!("Failing {} pending MCP request(s)", drained.len());
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its pending entry on drop.
pub struct PendingGuard {
    id: u64,
    pending: PendingRequests,
}

impl PendingGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Wait for a registered completion. A dropped sender means the table was
/// torn down underneath us.
pub(crate) async fn wait_for(
    rx: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
) -> Result<JsonRpcResponse, McpError> {
    rx.await.unwrap_or(Err(McpError::ConnectionClosed))
}
