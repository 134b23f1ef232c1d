use crate::registry::ClientConnectionContext;
use crate::traits::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Narrow contract between the gateway core and the in-process hub framework
///
/// The core never binds methods or serializes arguments itself; it only
/// delivers opaque payloads and connection lifecycle events to the hub side.
#[async_trait]
pub trait HubDispatcher: Send + Sync {
    /// A client's logical connection was opened by the relay service
    async fn on_client_connected(&self, ctx: Arc<ClientConnectionContext>) -> Result<()>;

    /// A client's logical connection was closed (by the relay or locally)
    async fn on_client_disconnected(&self, connection_id: &str, error: Option<String>)
        -> Result<()>;

    /// A client-originated invocation payload arrived for a local connection
    ///
    /// The payload is the hub protocol's wire encoding and is treated as
    /// opaque bytes by the core.
    async fn on_client_message(&self, connection_id: &str, payload: Bytes) -> Result<()>;

    /// A set of client connections was handed off between physical service
    /// connections. The clients never renegotiate; this is informational.
    async fn on_clients_migrated(&self, connection_ids: &[String], from_slot: usize, to_slot: usize) {
        let _ = (connection_ids, from_slot, to_slot);
    }
}

/// A no-op dispatcher that discards everything (useful in tests)
pub struct NoOpDispatcher;

#[async_trait]
impl HubDispatcher for NoOpDispatcher {
    async fn on_client_connected(&self, _ctx: Arc<ClientConnectionContext>) -> Result<()> {
        Ok(())
    }

    async fn on_client_disconnected(
        &self,
        _connection_id: &str,
        _error: Option<String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_client_message(&self, _connection_id: &str, _payload: Bytes) -> Result<()> {
        Ok(())
    }
}
