//! Environment-based configuration for binaries
//!
//! Connection strings and the server identity come from the environment
//! (optionally via a `.env` file loaded by the binary).

use anyhow::{bail, Context};

/// Configuration resolved from the environment
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Identity of this application server
    pub server_id: String,
    /// One relay connection string per configured endpoint
    pub connection_strings: Vec<String>,
}

/// Load gateway configuration from environment variables
///
/// - `RELAY_SERVER_ID`: server identity (defaults to `relay-gateway-<pid>`)
/// - `RELAY_CONNECTION_STRING`: the first endpoint (required)
/// - `RELAY_CONNECTION_STRING_1`, `_2`, ...: additional endpoints
pub fn load_env_config() -> anyhow::Result<EnvConfig> {
    let server_id = std::env::var("RELAY_SERVER_ID")
        .unwrap_or_else(|_| format!("relay-gateway-{}", std::process::id()));

    let mut connection_strings = vec![std::env::var("RELAY_CONNECTION_STRING")
        .context("RELAY_CONNECTION_STRING is not set")?];
    let mut index = 1;
    while let Ok(extra) = std::env::var(format!("RELAY_CONNECTION_STRING_{}", index)) {
        connection_strings.push(extra);
        index += 1;
    }

    for connection_string in &connection_strings {
        if connection_string.trim().is_empty() {
            bail!("empty relay connection string");
        }
    }

    Ok(EnvConfig {
        server_id,
        connection_strings,
    })
}
