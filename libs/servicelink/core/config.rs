//! Tunables for containers and the gateway facade.

use crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::traits::backoff::{BackOffPolicy, ExponentialBackOff};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// How a container treats still-connected clients during graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Tear everything down immediately
    Off,
    /// Wait (bounded by the shutdown timeout) for clients to drain themselves
    WaitForClients,
    /// Wait the full timeout, then force-close whatever remains
    FixedTimeout,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub mode: ShutdownMode,
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::WaitForClients,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Per-endpoint connection container configuration
#[derive(Clone)]
pub struct ContainerConfig {
    /// Number of multiplexed service connections to keep per endpoint
    pub connection_count: usize,
    /// Service protocol version requested during handshake
    pub protocol_version: i32,
    pub handshake_timeout: Duration,
    /// Interval between outbound Ping frames
    pub keepalive_interval: Duration,
    /// A connection with no inbound traffic for this long is considered dead
    pub stale_timeout: Duration,
    /// How long to wait for a service ack before failing the operation
    pub ack_timeout: Duration,
    /// Outbound queue depth per connection; a full queue applies backpressure
    pub outbound_queue_size: usize,
    pub max_frame_size: usize,
    pub backoff: Arc<dyn BackOffPolicy>,
    /// Payload pushed to every connected client when draining starts
    pub drain_notice: Option<Bytes>,
    pub shutdown: ShutdownConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            connection_count: 2,
            protocol_version: 1,
            handshake_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            stale_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(5),
            outbound_queue_size: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backoff: Arc::new(ExponentialBackOff::default()),
            drain_notice: None,
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl std::fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("connection_count", &self.connection_count)
            .field("protocol_version", &self.protocol_version)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("stale_timeout", &self.stale_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("outbound_queue_size", &self.outbound_queue_size)
            .field("max_frame_size", &self.max_frame_size)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Gateway-wide configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identity of this application server, embedded in invocation ids
    pub server_id: String,
    /// How long a server-to-client invocation may stay pending
    pub invocation_timeout: Duration,
    pub container: ContainerConfig,
}

impl GatewayConfig {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            invocation_timeout: Duration::from_secs(30),
            container: ContainerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ContainerConfig::default();
        assert!(config.connection_count >= 1);
        assert!(config.handshake_timeout < config.stale_timeout);
        assert!(config.keepalive_interval < config.stale_timeout);
        assert_eq!(config.shutdown.mode, ShutdownMode::WaitForClients);
    }
}
