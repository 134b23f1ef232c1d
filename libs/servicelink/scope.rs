//! Per-call scoped context.
//!
//! Cross-cutting call metadata (diagnostic flag, preferred outbound slot,
//! tracing correlation) is carried as an explicit value through the async
//! call chain rather than through implicit task-local propagation. Because
//! the scope is an owned value, it cannot leak into unrelated operations and
//! needs no cleanup on any exit path.

use tokio_util::sync::CancellationToken;

/// Ambient metadata for one logical outbound operation
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    /// Marks traffic from a diagnostic client (logged more verbosely)
    pub diagnostic_client: bool,
    /// Pin the operation to a specific connection slot when it is live
    pub preferred_slot: Option<usize>,
    /// Correlation number attached to every frame sent under this scope
    pub tracing_id: Option<u64>,
    /// Cancels the awaiting side of this call without touching others
    pub cancellation: Option<CancellationToken>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostic(mut self) -> Self {
        self.diagnostic_client = true;
        self
    }

    pub fn with_preferred_slot(mut self, slot: usize) -> Self {
        self.preferred_slot = Some(slot);
        self
    }

    pub fn with_tracing_id(mut self, tracing_id: u64) -> Self {
        self.tracing_id = Some(tracing_id);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
