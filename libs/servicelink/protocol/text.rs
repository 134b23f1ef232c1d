//! Record-separator-delimited JSON framing.
//!
//! A human-debuggable alternative to the binary codec: each envelope is its
//! UTF-8 JSON encoding terminated by the ASCII record separator (0x1E).
//! Follows the same "need more data" discipline as the binary codec.

use super::message::ServiceEnvelope;
use crate::traits::error::{Result, ServiceLinkError};
use bytes::{Buf, BufMut, BytesMut};

/// ASCII record separator terminating each JSON record
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Text service protocol codec
#[derive(Debug, Clone)]
pub struct TextCodec {
    max_frame_size: usize,
}

impl Default for TextCodec {
    fn default() -> Self {
        Self {
            max_frame_size: super::codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TextCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Append the delimited JSON encoding of `envelope` to `dst`
    pub fn encode(&self, envelope: &ServiceEnvelope, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(envelope)
            .map_err(|e| ServiceLinkError::Serialization(e.to_string()))?;
        if json.len() > self.max_frame_size {
            return Err(ServiceLinkError::Protocol(format!(
                "record of {} bytes exceeds limit of {}",
                json.len(),
                self.max_frame_size
            )));
        }
        dst.extend_from_slice(&json);
        dst.put_u8(RECORD_SEPARATOR);
        Ok(())
    }

    /// Try to decode one record from the front of `src`
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<ServiceEnvelope>> {
        let Some(end) = src.iter().position(|&b| b == RECORD_SEPARATOR) else {
            if src.len() > self.max_frame_size {
                return Err(ServiceLinkError::Protocol(
                    "unterminated record exceeds frame limit".into(),
                ));
            }
            return Ok(None);
        };
        let record = src.split_to(end);
        src.advance(1); // separator
        serde_json::from_slice(&record)
            .map(Some)
            .map_err(|e| ServiceLinkError::Protocol(format!("malformed JSON record: {}", e)))
    }
}
