//! Binary runner utilities
//!
//! Provides a standardized way to run binaries with proper
//! logging and graceful shutdown.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for a binary
///
/// Respects `RUST_LOG`; defaults to `info` for everything.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Configuration for running a binary application
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the binary (for logging)
    pub name: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl RunConfig {
    /// Create a new run configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval_secs: 60,
        }
    }

    /// Set heartbeat interval
    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Print startup banner
    pub fn print_banner(&self) {
        info!("");
        info!("========================================");
        info!("Starting {}", self.name);
        info!("Press Ctrl+C to stop");
        info!("========================================");
        info!("");
    }

    /// Print shutdown banner
    pub fn print_shutdown(&self) {
        info!("");
        info!("========================================");
        info!("{} stopped gracefully", self.name);
        info!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new("test-binary").with_heartbeat(120);
        assert_eq!(config.name, "test-binary");
        assert_eq!(config.heartbeat_interval_secs, 120);
    }

    #[test]
    fn test_default_config() {
        let config = RunConfig::new("default");
        assert_eq!(config.heartbeat_interval_secs, 60);
    }
}
