//! # ServiceLink Traits
//!
//! Core traits and types for the servicelink gateway library.
//!
//! These are the seams the rest of the crate is built around:
//!
//! - **BackOffPolicy**: Control reconnect pacing
//! - **CredentialProvider**: Attach a bearer credential to each connection
//! - **HubDispatcher**: Deliver payloads and lifecycle events to the hub side
//! - **HubProtocol**: Pluggable payload serializer
//! - **RandomSource**: Injectable randomness for endpoint selection

pub mod backoff;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod random;

// Re-export commonly used types
pub use backoff::{BackOffPolicy, ExponentialBackOff, FixedBackOff, NoRetry};
pub use credential::{CredentialProvider, StaticCredential};
pub use dispatch::{HubDispatcher, NoOpDispatcher};
pub use error::{Result, ServiceLinkError};
pub use protocol::{HubProtocol, JsonHubProtocol};
pub use random::{RandomSource, SeededRandom, ThreadRandom};
