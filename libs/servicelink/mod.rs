//! # ServiceLink
//!
//! Application-server side of a relay-based real-time messaging gateway:
//! a pool of multiplexed WebSocket connections to relay endpoints, with
//! message routing, reconnection, invocation correlation and a binary
//! framed wire protocol.
//!
//! ## Features
//!
//! - **Connection containers**: N supervised connections per endpoint with
//!   pluggable backoff, generation-tagged slots and client migration
//! - **Routing**: composable strategy chain over multi-endpoint fan-out and
//!   capacity-weighted negotiate selection
//! - **Invocations**: server-to-client RPC with exactly-once completion,
//!   cancellation and timeout, relayed across instances when needed
//! - **Wire protocol**: varint-framed binary codec plus a JSON text framing,
//!   both safe against arbitrary chunk splits
//! - **Seams everywhere**: hub dispatch, payload serialization, credentials,
//!   backoff and randomness are all trait objects with default impls

pub mod core;
pub mod endpoint;
pub mod invocation;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod scope;
pub mod traits;

// Re-export the traits and error types
pub use traits::*;

// Re-export the main surface
pub use crate::core::{
    ContainerConfig, ContainerSnapshot, ContainerStatus, GatewayConfig, GatewaySnapshot,
    RelayGateway, RelayGatewayBuilder, ServiceConnectionContainer, ShutdownConfig, ShutdownMode,
};
pub use endpoint::{Endpoint, EndpointCapacity, EndpointType};
pub use invocation::InvocationManager;
pub use protocol::{ServiceCodec, ServiceEnvelope, ServiceMessage, TextCodec};
pub use registry::{ClientConnectionContext, ClientConnectionRegistry, ServingTag};
pub use routing::{DefaultRouter, EndpointRouter, NegotiateResponse, RouterChain};
pub use scope::CallScope;
