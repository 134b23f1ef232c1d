//! Connection core: physical connections, their per-endpoint containers and
//! the gateway facade that ties everything together.

pub mod ack;
pub mod config;
pub mod connection;
pub mod container;
pub mod dispatcher;
pub mod manager;

pub use ack::AckTable;
pub use config::{ContainerConfig, GatewayConfig, ShutdownConfig, ShutdownMode};
pub use connection::{ConnectionSettings, ConnectionStatus, ServiceConnection};
pub use container::{ContainerSnapshot, ContainerStatus, ServiceConnectionContainer};
pub use dispatcher::{DispatchContext, MessageDispatcher};
pub use manager::{GatewaySnapshot, RelayGateway, RelayGatewayBuilder};
