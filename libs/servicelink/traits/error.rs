use thiserror::Error;

/// Main error type for servicelink
#[derive(Error, Debug)]
pub enum ServiceLinkError {
    /// Transport-level failure (socket error, TLS failure, write failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// The underlying connection closed unexpectedly
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Handshake with the relay service failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The relay service rejected our protocol version
    #[error("protocol version {requested} not supported by service: {message}")]
    ProtocolVersionNotSupported { requested: i32, message: String },

    /// Authorization rejected by the relay service (not retryable)
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    /// A malformed or unexpected frame was received
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No primary or secondary endpoint is online.
    ///
    /// Distinct from transport errors so callers can tell a
    /// configuration/outage problem from a transient blip.
    #[error("no service endpoint is connected")]
    ServiceNotConnected,

    /// An awaited operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An awaited operation was canceled by its cancellation token
    #[error("operation canceled: {0}")]
    Canceled(String),

    /// Internal channel closed while an operation was in flight
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration error (bad connection string, missing endpoint, ...)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Payload serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A bounded backoff sequence was exhausted; carries every attempt's error
    #[error("reconnect attempts exhausted after {attempts} attempts: [{}]", .errors.join("; "))]
    ReconnectExhausted { attempts: usize, errors: Vec<String> },
}

impl ServiceLinkError {
    /// Whether the container may retry the operation that produced this error.
    ///
    /// Version mismatch, authorization failures and malformed handshakes are
    /// fatal per attempt; transport-level failures are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceLinkError::Transport(_)
                | ServiceLinkError::ConnectionClosed(_)
                | ServiceLinkError::Timeout(_)
                | ServiceLinkError::ChannelClosed(_)
        )
    }
}

/// Result type for servicelink operations
pub type Result<T> = std::result::Result<T, ServiceLinkError>;
