//! Request ID allocation.
//!
//! IDs come from one process-wide counter rather than a per-connection one,
//! so two clients talking to servers at the same time never hand out the
//! same ID. The counter starts at 1; id `0` is reserved.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-wide request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Source of request IDs for a client.
///
/// Every returned ID must be non-zero and unique among the IDs still
/// pending on the connection.
pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// The process-wide counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalIds;

impl IdAllocator for GlobalIds {
    fn next_id(&self) -> u64 {
        next_request_id()
    }
}

/// A private counter, mostly useful for deterministic tests.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Start counting at `first` (bumped to 1 if zero).
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }
}

impl IdAllocator for SequentialIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
