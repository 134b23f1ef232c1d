//! Inbound frame dispatch.
//!
//! One dispatcher per container routes every decoded frame to the registry,
//! the invocation manager, the ack table or the hub. A dispatch may produce a
//! reply envelope; the owning connection writes it back through its own
//! outbound queue so the single-writer rule holds.

use super::ack::AckTable;
use crate::invocation::InvocationManager;
use crate::protocol::message::{AckStatus, ServiceEnvelope, ServiceMessage};
use crate::registry::{ClientConnectionContext, ClientConnectionRegistry, ServingTag};
use crate::traits::dispatch::HubDispatcher;
use crate::traits::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-connection dispatch context: which physical connection a frame arrived
/// on, and whether the container still accepts new client connections.
pub struct DispatchContext {
    pub serving: ServingTag,
    pub accepting_opens: Arc<AtomicBool>,
}

pub struct MessageDispatcher {
    registry: Arc<ClientConnectionRegistry>,
    invocations: Arc<InvocationManager>,
    hub: Arc<dyn HubDispatcher>,
    acks: Arc<AckTable>,
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<ClientConnectionRegistry>,
        invocations: Arc<InvocationManager>,
        hub: Arc<dyn HubDispatcher>,
        acks: Arc<AckTable>,
    ) -> Self {
        Self {
            registry,
            invocations,
            hub,
            acks,
        }
    }

    pub fn registry(&self) -> &Arc<ClientConnectionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<dyn HubDispatcher> {
        &self.hub
    }

    /// Handle one inbound envelope; the returned envelope (if any) must be
    /// written back on the connection the frame arrived on.
    pub async fn dispatch(
        &self,
        envelope: ServiceEnvelope,
        ctx: &DispatchContext,
    ) -> Result<Option<ServiceEnvelope>> {
        let tracing_id = envelope.tracing_id;
        match envelope.message {
            ServiceMessage::Ping => Ok(None),

            ServiceMessage::Ack {
                ack_id,
                status,
                message,
            } => {
                self.acks.complete(ack_id, status, message);
                Ok(None)
            }

            ServiceMessage::OpenConnection {
                connection_id,
                user_id,
                claims,
            } => {
                if !ctx.accepting_opens.load(Ordering::Acquire) {
                    debug!(connection_id = %connection_id, "rejecting open while draining");
                    let reply = ServiceMessage::CloseConnection {
                        connection_id,
                        error: Some("server is draining".to_string()),
                        ack_id: None,
                    };
                    return Ok(Some(ServiceEnvelope::new(reply).with_tracing_id(tracing_id)));
                }

                let client = Arc::new(ClientConnectionContext::new(
                    connection_id.clone(),
                    user_id,
                    claims,
                    ctx.serving,
                ));
                if let Some(stale) = self.registry.add(client.clone()) {
                    warn!(connection_id = %connection_id, "open replaced an existing client entry");
                    stale.close();
                }
                debug!(
                    connection_id = %connection_id,
                    slot = ctx.serving.slot,
                    "client connected"
                );
                self.hub.on_client_connected(client).await?;
                Ok(None)
            }

            ServiceMessage::CloseConnection {
                connection_id,
                error,
                ack_id,
            } => {
                match self.registry.remove(&connection_id) {
                    Some(client) => {
                        client.close();
                        debug!(connection_id = %connection_id, "client disconnected");
                        self.hub
                            .on_client_disconnected(&connection_id, error)
                            .await?;
                    }
                    None => {
                        debug!(connection_id = %connection_id, "close for unknown client, ignoring");
                    }
                }
                // The service only asks for an ack on closes it needs confirmed
                Ok(ack_id.map(|ack_id| {
                    ServiceEnvelope::new(ServiceMessage::Ack {
                        ack_id,
                        status: AckStatus::Ok,
                        message: None,
                    })
                    .with_tracing_id(tracing_id)
                }))
            }

            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => {
                match self.registry.get(&connection_id) {
                    Some(client) if client.is_open() => {
                        self.hub.on_client_message(&connection_id, payload).await?;
                    }
                    _ => {
                        debug!(connection_id = %connection_id, "data for unknown or closed client, dropping");
                    }
                }
                Ok(None)
            }

            ServiceMessage::ServiceMapping {
                invocation_id,
                connection_id: _,
                instance_id,
            } => {
                self.invocations
                    .add_service_mapping(&invocation_id, instance_id);
                Ok(None)
            }

            ServiceMessage::ClientCompletion {
                invocation_id,
                connection_id,
                caller_server_id,
                protocol,
                payload,
            } => {
                if caller_server_id == self.invocations.server_id() {
                    // We issued this invocation; resolve the local waiter
                    self.invocations
                        .try_complete_result(&connection_id, &invocation_id, payload);
                    Ok(None)
                } else {
                    // We only own the connection; relay the completion back to
                    // the caller's instance with the payload untouched
                    Ok(self
                        .invocations
                        .complete_routed(&invocation_id, protocol, payload)
                        .map(|message| ServiceEnvelope::new(message).with_tracing_id(tracing_id)))
                }
            }

            // Server-to-service kinds and handshake frames are never expected
            // inbound after the handshake completes
            other => {
                warn!(kind = other.kind(), "unexpected inbound frame, ignoring");
                Ok(None)
            }
        }
    }
}
