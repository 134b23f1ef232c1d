//! Wire envelope exchanged with the relay service.
//!
//! Every message travels inside a [`ServiceEnvelope`] carrying an optional
//! tracing id (monotonic correlation number used for diagnostics only).
//! Payload fields are opaque hub-protocol bytes; the core never inspects them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome carried on an `Ack` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckStatus {
    Ok,
    Error,
    Timeout,
}

/// Why a handshake was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeErrorKind {
    /// The service does not speak the requested protocol version (fatal)
    VersionNotSupported,
    /// The bearer credential was rejected (fatal)
    Unauthorized,
    /// Any other rejection
    Other,
}

/// Handshake rejection detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeError {
    pub kind: HandshakeErrorKind,
    pub message: String,
}

/// Tagged message variant, one per wire frame kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceMessage {
    /// Client half of the version negotiation preceding any data frame
    HandshakeRequest { version: i32 },
    /// Service half: `error: None` means the version was accepted
    HandshakeResponse { error: Option<HandshakeError> },
    /// Liveness probe; both sides send these periodically
    Ping,
    /// Confirmation for an ack-requiring frame
    Ack {
        ack_id: u32,
        status: AckStatus,
        message: Option<String>,
    },
    /// A new end-user connection was routed to this server
    OpenConnection {
        connection_id: String,
        user_id: Option<String>,
        claims: HashMap<String, String>,
    },
    /// An end-user connection went away (or should be torn down)
    CloseConnection {
        connection_id: String,
        error: Option<String>,
        ack_id: Option<u32>,
    },
    /// Invocation data for one specific connection (either direction)
    ConnectionData {
        connection_id: String,
        payload: Bytes,
    },
    /// Fan-out to every connection except the excluded ids
    BroadcastData {
        excluded: Vec<String>,
        payload: Bytes,
    },
    /// Deliver to every connection of one user
    UserData { user_id: String, payload: Bytes },
    /// Deliver to every connection of several users
    MultiUserData {
        user_ids: Vec<String>,
        payload: Bytes,
    },
    /// Deliver to a group, minus excluded connection ids
    GroupBroadcastData {
        group_name: String,
        excluded: Vec<String>,
        payload: Bytes,
    },
    /// Deliver to several groups
    MultiGroupBroadcastData {
        group_names: Vec<String>,
        payload: Bytes,
    },
    /// Add a connection to a group (ack-requiring)
    JoinGroup {
        connection_id: String,
        group_name: String,
        ack_id: Option<u32>,
    },
    /// Remove a connection from a group (ack-requiring)
    LeaveGroup {
        connection_id: String,
        group_name: String,
        ack_id: Option<u32>,
    },
    /// Which service instance actually serves a target connection
    ServiceMapping {
        invocation_id: String,
        connection_id: String,
        instance_id: String,
    },
    /// Completion of a server-to-client invocation, possibly relayed across
    /// instances. The payload keeps its original wire encoding; `protocol`
    /// names the hub protocol that produced it.
    ClientCompletion {
        invocation_id: String,
        connection_id: String,
        caller_server_id: String,
        protocol: String,
        payload: Bytes,
    },
}

impl ServiceMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceMessage::HandshakeRequest { .. } => "HandshakeRequest",
            ServiceMessage::HandshakeResponse { .. } => "HandshakeResponse",
            ServiceMessage::Ping => "Ping",
            ServiceMessage::Ack { .. } => "Ack",
            ServiceMessage::OpenConnection { .. } => "OpenConnection",
            ServiceMessage::CloseConnection { .. } => "CloseConnection",
            ServiceMessage::ConnectionData { .. } => "ConnectionData",
            ServiceMessage::BroadcastData { .. } => "BroadcastData",
            ServiceMessage::UserData { .. } => "UserData",
            ServiceMessage::MultiUserData { .. } => "MultiUserData",
            ServiceMessage::GroupBroadcastData { .. } => "GroupBroadcastData",
            ServiceMessage::MultiGroupBroadcastData { .. } => "MultiGroupBroadcastData",
            ServiceMessage::JoinGroup { .. } => "JoinGroup",
            ServiceMessage::LeaveGroup { .. } => "LeaveGroup",
            ServiceMessage::ServiceMapping { .. } => "ServiceMapping",
            ServiceMessage::ClientCompletion { .. } => "ClientCompletion",
        }
    }

    /// Ack id, for ack-requiring message kinds
    pub fn ack_id(&self) -> Option<u32> {
        match self {
            ServiceMessage::CloseConnection { ack_id, .. }
            | ServiceMessage::JoinGroup { ack_id, .. }
            | ServiceMessage::LeaveGroup { ack_id, .. } => *ack_id,
            _ => None,
        }
    }
}

/// One framed unit on the wire: an optional tracing id plus the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEnvelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tracing_id: Option<u64>,
    pub message: ServiceMessage,
}

impl ServiceEnvelope {
    pub fn new(message: ServiceMessage) -> Self {
        Self {
            tracing_id: None,
            message,
        }
    }

    pub fn with_tracing_id(mut self, tracing_id: Option<u64>) -> Self {
        self.tracing_id = tracing_id;
        self
    }
}

impl From<ServiceMessage> for ServiceEnvelope {
    fn from(message: ServiceMessage) -> Self {
        Self::new(message)
    }
}
