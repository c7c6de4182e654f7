//! Why a task ended up on disk instead of going straight to the wire.

use serde::{Deserialize, Serialize};

/// Taxonomy of reasons a [`crate::TaskQueue`] accepted a task.
///
/// Carried alongside the task purely for metrics/diagnostics; it plays no
/// part in dequeue ordering or retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueingReason {
    /// The sender-task pool's rate limiter had no tokens available.
    RateLimit,
    /// The in-memory batch buffer was at capacity.
    BufferSize,
    /// The proxy is shutting down and is draining buffers to disk.
    ProxyShutdown,
    /// The backend returned a retryable server-side error (407/408/429/5xx or
    /// a network failure).
    ServerError,
}

impl QueueingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueingReason::RateLimit => "RATE_LIMIT",
            QueueingReason::BufferSize => "BUFFER_SIZE",
            QueueingReason::ProxyShutdown => "PROXY_SHUTDOWN",
            QueueingReason::ServerError => "SERVER_ERROR",
        }
    }
}
