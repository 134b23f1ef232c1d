use crate::traits::error::{Result, ServiceLinkError};
use bytes::Bytes;

/// Pluggable hub payload serializer
///
/// The relay wire protocol carries hub payloads as opaque byte strings; this
/// trait is the seam through which typed results are encoded and decoded.
/// Implementations exchange `serde_json::Value` so the trait stays object
/// safe; callers convert to concrete types at the edge.
pub trait HubProtocol: Send + Sync {
    /// Protocol name carried on completion messages (e.g. "json")
    fn name(&self) -> &'static str;

    /// Encode a value into the protocol's wire form
    fn to_bytes(&self, value: &serde_json::Value) -> Result<Bytes>;

    /// Decode the protocol's wire form into a value
    fn from_bytes(&self, payload: &[u8]) -> Result<serde_json::Value>;
}

/// JSON hub protocol
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, value: &serde_json::Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| ServiceLinkError::Serialization(e.to_string()))
    }

    fn from_bytes(&self, payload: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(payload)
            .map_err(|e| ServiceLinkError::Serialization(e.to_string()))
    }
}
