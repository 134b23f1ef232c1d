//! Relay Gateway - Main Library
//!
//! Thin presentation layer over the `servicelink` workspace library.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (env config, runner)
//! - **servicelink**: Core gateway logic (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use relay_gateway::bin_common::{init_tracing, load_env_config};
//! use relay_gateway::servicelink::{GatewayConfig, RelayGateway};
//! ```

// Re-export the workspace library for convenience
pub use servicelink;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_env_config, EnvConfig};
    pub use runner::{init_tracing, RunConfig};
}
