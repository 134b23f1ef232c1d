//! Binary framing for the service protocol.
//!
//! Each frame is a varint length prefix followed by the message body:
//!
//! ```text
//! ┌────────────┬─────┬───────┬─────────────────┬────────────┐
//! │ varint len │ tag │ flags │ [varint tracing]│ fields ... │
//! └────────────┴─────┴───────┴─────────────────┴────────────┘
//! ```
//!
//! `flags` bit 0 marks an attached tracing id. Strings are varint-length
//! UTF-8; byte strings are varint-length raw; lists are a varint count of
//! strings; optionals are a presence byte.
//!
//! The decoder works over an accumulation buffer and returns `Ok(None)` when
//! no complete frame is available yet, so frames may arrive split at any
//! chunk boundary.

use super::message::{
    AckStatus, HandshakeError, HandshakeErrorKind, ServiceEnvelope, ServiceMessage,
};
use super::varint::{read_varint, read_varint_u64, write_varint};
use crate::traits::error::{Result, ServiceLinkError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

const TAG_HANDSHAKE_REQUEST: u8 = 1;
const TAG_HANDSHAKE_RESPONSE: u8 = 2;
const TAG_PING: u8 = 3;
const TAG_ACK: u8 = 4;
const TAG_OPEN_CONNECTION: u8 = 5;
const TAG_CLOSE_CONNECTION: u8 = 6;
const TAG_CONNECTION_DATA: u8 = 7;
const TAG_BROADCAST_DATA: u8 = 8;
const TAG_USER_DATA: u8 = 9;
const TAG_MULTI_USER_DATA: u8 = 10;
const TAG_GROUP_BROADCAST_DATA: u8 = 11;
const TAG_MULTI_GROUP_BROADCAST_DATA: u8 = 12;
const TAG_JOIN_GROUP: u8 = 13;
const TAG_LEAVE_GROUP: u8 = 14;
const TAG_SERVICE_MAPPING: u8 = 15;
const TAG_CLIENT_COMPLETION: u8 = 16;

const FLAG_TRACING_ID: u8 = 0x01;

/// Default cap on a single frame's body size
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Binary service protocol codec
#[derive(Debug, Clone)]
pub struct ServiceCodec {
    max_frame_size: usize,
}

impl Default for ServiceCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServiceCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Append the framed encoding of `envelope` to `dst`
    pub fn encode(&self, envelope: &ServiceEnvelope, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::with_capacity(64);
        encode_body(envelope, &mut body);
        if body.len() > self.max_frame_size {
            return Err(ServiceLinkError::Protocol(format!(
                "frame body of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_size
            )));
        }
        write_varint(body.len() as u64, dst);
        dst.extend_from_slice(&body);
        Ok(())
    }

    /// Try to decode one frame from the front of `src`
    ///
    /// Consumes the frame's bytes on success. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<ServiceEnvelope>> {
        let Some((body_len, prefix_len)) = read_varint(&src[..])? else {
            return Ok(None);
        };
        let body_len = body_len as usize;
        if body_len > self.max_frame_size {
            return Err(ServiceLinkError::Protocol(format!(
                "frame body of {} bytes exceeds limit of {}",
                body_len, self.max_frame_size
            )));
        }
        if src.len() < prefix_len + body_len {
            return Ok(None);
        }
        src.advance(prefix_len);
        let body = src.split_to(body_len).freeze();
        decode_body(&body).map(Some)
    }
}

fn encode_body(envelope: &ServiceEnvelope, dst: &mut BytesMut) {
    let tag = match &envelope.message {
        ServiceMessage::HandshakeRequest { .. } => TAG_HANDSHAKE_REQUEST,
        ServiceMessage::HandshakeResponse { .. } => TAG_HANDSHAKE_RESPONSE,
        ServiceMessage::Ping => TAG_PING,
        ServiceMessage::Ack { .. } => TAG_ACK,
        ServiceMessage::OpenConnection { .. } => TAG_OPEN_CONNECTION,
        ServiceMessage::CloseConnection { .. } => TAG_CLOSE_CONNECTION,
        ServiceMessage::ConnectionData { .. } => TAG_CONNECTION_DATA,
        ServiceMessage::BroadcastData { .. } => TAG_BROADCAST_DATA,
        ServiceMessage::UserData { .. } => TAG_USER_DATA,
        ServiceMessage::MultiUserData { .. } => TAG_MULTI_USER_DATA,
        ServiceMessage::GroupBroadcastData { .. } => TAG_GROUP_BROADCAST_DATA,
        ServiceMessage::MultiGroupBroadcastData { .. } => TAG_MULTI_GROUP_BROADCAST_DATA,
        ServiceMessage::JoinGroup { .. } => TAG_JOIN_GROUP,
        ServiceMessage::LeaveGroup { .. } => TAG_LEAVE_GROUP,
        ServiceMessage::ServiceMapping { .. } => TAG_SERVICE_MAPPING,
        ServiceMessage::ClientCompletion { .. } => TAG_CLIENT_COMPLETION,
    };
    dst.put_u8(tag);
    match envelope.tracing_id {
        Some(id) => {
            dst.put_u8(FLAG_TRACING_ID);
            write_varint(id, dst);
        }
        None => dst.put_u8(0),
    }

    match &envelope.message {
        ServiceMessage::HandshakeRequest { version } => {
            dst.put_i32(*version);
        }
        ServiceMessage::HandshakeResponse { error } => match error {
            Some(err) => {
                dst.put_u8(1);
                dst.put_u8(handshake_kind_to_byte(err.kind));
                put_string(dst, &err.message);
            }
            None => dst.put_u8(0),
        },
        ServiceMessage::Ping => {}
        ServiceMessage::Ack {
            ack_id,
            status,
            message,
        } => {
            dst.put_u32(*ack_id);
            dst.put_u8(match status {
                AckStatus::Ok => 0,
                AckStatus::Error => 1,
                AckStatus::Timeout => 2,
            });
            put_opt_string(dst, message.as_deref());
        }
        ServiceMessage::OpenConnection {
            connection_id,
            user_id,
            claims,
        } => {
            put_string(dst, connection_id);
            put_opt_string(dst, user_id.as_deref());
            write_varint(claims.len() as u64, dst);
            for (key, value) in claims {
                put_string(dst, key);
                put_string(dst, value);
            }
        }
        ServiceMessage::CloseConnection {
            connection_id,
            error,
            ack_id,
        } => {
            put_string(dst, connection_id);
            put_opt_string(dst, error.as_deref());
            put_opt_u32(dst, *ack_id);
        }
        ServiceMessage::ConnectionData {
            connection_id,
            payload,
        } => {
            put_string(dst, connection_id);
            put_bytes(dst, payload);
        }
        ServiceMessage::BroadcastData { excluded, payload } => {
            put_string_list(dst, excluded);
            put_bytes(dst, payload);
        }
        ServiceMessage::UserData { user_id, payload } => {
            put_string(dst, user_id);
            put_bytes(dst, payload);
        }
        ServiceMessage::MultiUserData { user_ids, payload } => {
            put_string_list(dst, user_ids);
            put_bytes(dst, payload);
        }
        ServiceMessage::GroupBroadcastData {
            group_name,
            excluded,
            payload,
        } => {
            put_string(dst, group_name);
            put_string_list(dst, excluded);
            put_bytes(dst, payload);
        }
        ServiceMessage::MultiGroupBroadcastData {
            group_names,
            payload,
        } => {
            put_string_list(dst, group_names);
            put_bytes(dst, payload);
        }
        ServiceMessage::JoinGroup {
            connection_id,
            group_name,
            ack_id,
        }
        | ServiceMessage::LeaveGroup {
            connection_id,
            group_name,
            ack_id,
        } => {
            put_string(dst, connection_id);
            put_string(dst, group_name);
            put_opt_u32(dst, *ack_id);
        }
        ServiceMessage::ServiceMapping {
            invocation_id,
            connection_id,
            instance_id,
        } => {
            put_string(dst, invocation_id);
            put_string(dst, connection_id);
            put_string(dst, instance_id);
        }
        ServiceMessage::ClientCompletion {
            invocation_id,
            connection_id,
            caller_server_id,
            protocol,
            payload,
        } => {
            put_string(dst, invocation_id);
            put_string(dst, connection_id);
            put_string(dst, caller_server_id);
            put_string(dst, protocol);
            put_bytes(dst, payload);
        }
    }
}

fn decode_body(body: &Bytes) -> Result<ServiceEnvelope> {
    let mut reader = BodyReader::new(body);
    let tag = reader.u8()?;
    let flags = reader.u8()?;
    let tracing_id = if flags & FLAG_TRACING_ID != 0 {
        Some(reader.varint_u64()?)
    } else {
        None
    };

    let message = match tag {
        TAG_HANDSHAKE_REQUEST => ServiceMessage::HandshakeRequest {
            version: reader.i32()?,
        },
        TAG_HANDSHAKE_RESPONSE => {
            let error = if reader.u8()? != 0 {
                let kind = handshake_kind_from_byte(reader.u8()?)?;
                let message = reader.string()?;
                Some(HandshakeError { kind, message })
            } else {
                None
            };
            ServiceMessage::HandshakeResponse { error }
        }
        TAG_PING => ServiceMessage::Ping,
        TAG_ACK => ServiceMessage::Ack {
            ack_id: reader.u32()?,
            status: match reader.u8()? {
                0 => AckStatus::Ok,
                1 => AckStatus::Error,
                2 => AckStatus::Timeout,
                other => {
                    return Err(ServiceLinkError::Protocol(format!(
                        "unknown ack status {}",
                        other
                    )))
                }
            },
            message: reader.opt_string()?,
        },
        TAG_OPEN_CONNECTION => {
            let connection_id = reader.string()?;
            let user_id = reader.opt_string()?;
            let count = reader.varint()? as usize;
            let mut claims = HashMap::with_capacity(count);
            for _ in 0..count {
                let key = reader.string()?;
                let value = reader.string()?;
                claims.insert(key, value);
            }
            ServiceMessage::OpenConnection {
                connection_id,
                user_id,
                claims,
            }
        }
        TAG_CLOSE_CONNECTION => ServiceMessage::CloseConnection {
            connection_id: reader.string()?,
            error: reader.opt_string()?,
            ack_id: reader.opt_u32()?,
        },
        TAG_CONNECTION_DATA => ServiceMessage::ConnectionData {
            connection_id: reader.string()?,
            payload: reader.bytes()?,
        },
        TAG_BROADCAST_DATA => ServiceMessage::BroadcastData {
            excluded: reader.string_list()?,
            payload: reader.bytes()?,
        },
        TAG_USER_DATA => ServiceMessage::UserData {
            user_id: reader.string()?,
            payload: reader.bytes()?,
        },
        TAG_MULTI_USER_DATA => ServiceMessage::MultiUserData {
            user_ids: reader.string_list()?,
            payload: reader.bytes()?,
        },
        TAG_GROUP_BROADCAST_DATA => ServiceMessage::GroupBroadcastData {
            group_name: reader.string()?,
            excluded: reader.string_list()?,
            payload: reader.bytes()?,
        },
        TAG_MULTI_GROUP_BROADCAST_DATA => ServiceMessage::MultiGroupBroadcastData {
            group_names: reader.string_list()?,
            payload: reader.bytes()?,
        },
        TAG_JOIN_GROUP => ServiceMessage::JoinGroup {
            connection_id: reader.string()?,
            group_name: reader.string()?,
            ack_id: reader.opt_u32()?,
        },
        TAG_LEAVE_GROUP => ServiceMessage::LeaveGroup {
            connection_id: reader.string()?,
            group_name: reader.string()?,
            ack_id: reader.opt_u32()?,
        },
        TAG_SERVICE_MAPPING => ServiceMessage::ServiceMapping {
            invocation_id: reader.string()?,
            connection_id: reader.string()?,
            instance_id: reader.string()?,
        },
        TAG_CLIENT_COMPLETION => ServiceMessage::ClientCompletion {
            invocation_id: reader.string()?,
            connection_id: reader.string()?,
            caller_server_id: reader.string()?,
            protocol: reader.string()?,
            payload: reader.bytes()?,
        },
        other => {
            return Err(ServiceLinkError::Protocol(format!(
                "unknown message tag {}",
                other
            )))
        }
    };

    reader.finish()?;
    Ok(ServiceEnvelope {
        tracing_id,
        message,
    })
}

fn handshake_kind_to_byte(kind: HandshakeErrorKind) -> u8 {
    match kind {
        HandshakeErrorKind::VersionNotSupported => 1,
        HandshakeErrorKind::Unauthorized => 2,
        HandshakeErrorKind::Other => 3,
    }
}

fn handshake_kind_from_byte(byte: u8) -> Result<HandshakeErrorKind> {
    match byte {
        1 => Ok(HandshakeErrorKind::VersionNotSupported),
        2 => Ok(HandshakeErrorKind::Unauthorized),
        3 => Ok(HandshakeErrorKind::Other),
        other => Err(ServiceLinkError::Protocol(format!(
            "unknown handshake error kind {}",
            other
        ))),
    }
}

fn put_string(dst: &mut BytesMut, value: &str) {
    write_varint(value.len() as u64, dst);
    dst.extend_from_slice(value.as_bytes());
}

fn put_opt_string(dst: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put_string(dst, value);
        }
        None => dst.put_u8(0),
    }
}

fn put_opt_u32(dst: &mut BytesMut, value: Option<u32>) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            dst.put_u32(value);
        }
        None => dst.put_u8(0),
    }
}

fn put_bytes(dst: &mut BytesMut, value: &Bytes) {
    write_varint(value.len() as u64, dst);
    dst.extend_from_slice(value);
}

fn put_string_list(dst: &mut BytesMut, values: &[String]) {
    write_varint(values.len() as u64, dst);
    for value in values {
        put_string(dst, value);
    }
}

/// Cursor over one complete frame body.
///
/// Truncation inside a complete body is a protocol error, not "need more
/// data" — the length prefix promised the whole body was present.
struct BodyReader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(ServiceLinkError::Protocol(
                "truncated message body".into(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn varint(&mut self) -> Result<u64> {
        match read_varint(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ServiceLinkError::Protocol(
                "truncated varint in message body".into(),
            )),
        }
    }

    /// Full-range u64 varint, for tracing ids rather than lengths
    fn varint_u64(&mut self) -> Result<u64> {
        match read_varint_u64(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ServiceLinkError::Protocol(
                "truncated varint in message body".into(),
            )),
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ServiceLinkError::Protocol("invalid UTF-8 in string field".into()))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        if self.u8()? != 0 {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn opt_u32(&mut self) -> Result<Option<u32>> {
        if self.u8()? != 0 {
            Ok(Some(self.u32()?))
        } else {
            Ok(None)
        }
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.varint()? as usize;
        let start = self.pos;
        self.take(len)?;
        Ok(self.buf.slice(start..start + len))
    }

    fn string_list(&mut self) -> Result<Vec<String>> {
        let count = self.varint()? as usize;
        let mut values = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            values.push(self.string()?);
        }
        Ok(values)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(ServiceLinkError::Protocol(format!(
                "{} trailing bytes after message body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<ServiceEnvelope> {
        vec![
            ServiceEnvelope::new(ServiceMessage::HandshakeRequest { version: 1 }),
            ServiceEnvelope::new(ServiceMessage::HandshakeResponse { error: None }),
            ServiceEnvelope::new(ServiceMessage::HandshakeResponse {
                error: Some(HandshakeError {
                    kind: HandshakeErrorKind::VersionNotSupported,
                    message: "requested version 99".into(),
                }),
            }),
            ServiceEnvelope::new(ServiceMessage::Ping).with_tracing_id(Some(42)),
            ServiceEnvelope::new(ServiceMessage::Ack {
                ack_id: 7,
                status: AckStatus::Ok,
                message: None,
            }),
            ServiceEnvelope::new(ServiceMessage::OpenConnection {
                connection_id: "conn-1".into(),
                user_id: Some("user-a".into()),
                claims: [("role".to_string(), "admin".to_string())].into(),
            }),
            ServiceEnvelope::new(ServiceMessage::CloseConnection {
                connection_id: "conn-1".into(),
                error: Some("gone".into()),
                ack_id: Some(9),
            }),
            ServiceEnvelope::new(ServiceMessage::ConnectionData {
                connection_id: "conn-1".into(),
                payload: Bytes::from_static(b"{\"target\":\"echo\"}"),
            })
            .with_tracing_id(Some(u64::from(u32::MAX) + 17)),
            ServiceEnvelope::new(ServiceMessage::BroadcastData {
                excluded: vec!["conn-2".into(), "conn-3".into()],
                payload: Bytes::from_static(b"hello"),
            }),
            ServiceEnvelope::new(ServiceMessage::GroupBroadcastData {
                group_name: "lobby".into(),
                excluded: vec![],
                payload: Bytes::from_static(b"x"),
            }),
            ServiceEnvelope::new(ServiceMessage::MultiGroupBroadcastData {
                group_names: vec!["a".into(), "b".into()],
                payload: Bytes::new(),
            }),
            ServiceEnvelope::new(ServiceMessage::JoinGroup {
                connection_id: "conn-1".into(),
                group_name: "lobby".into(),
                ack_id: Some(1),
            }),
            ServiceEnvelope::new(ServiceMessage::ServiceMapping {
                invocation_id: "srv-conn-1-5".into(),
                connection_id: "conn-1".into(),
                instance_id: "instance-b".into(),
            }),
            ServiceEnvelope::new(ServiceMessage::ClientCompletion {
                invocation_id: "srv-conn-1-5".into(),
                connection_id: "conn-1".into(),
                caller_server_id: "srv".into(),
                protocol: "json".into(),
                payload: Bytes::from_static(b"{\"result\":3}"),
            }),
        ]
    }

    #[test]
    fn roundtrip_all_variants() {
        let codec = ServiceCodec::default();
        for envelope in sample_messages() {
            let mut buf = BytesMut::new();
            codec.encode(&envelope, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, envelope);
            assert!(buf.is_empty(), "decoder must consume the whole frame");
        }
    }

    #[test]
    fn split_at_every_byte_boundary_matches_contiguous() {
        let codec = ServiceCodec::default();
        let envelope = ServiceEnvelope::new(ServiceMessage::GroupBroadcastData {
            group_name: "lobby".into(),
            excluded: vec!["conn-9".into()],
            payload: Bytes::from_static(b"payload bytes"),
        })
        .with_tracing_id(Some(1234));

        let mut wire = BytesMut::new();
        codec.encode(&envelope, &mut wire).unwrap();
        let wire = wire.freeze();

        for split in 0..=wire.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            if split < wire.len() {
                // First segment alone must never produce a frame or an error
                assert!(codec.decode(&mut buf).unwrap().is_none(), "split {}", split);
            }
            buf.extend_from_slice(&wire[split..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, envelope, "split {}", split);
        }
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let codec = ServiceCodec::default();
        let mut buf = BytesMut::new();
        let messages = sample_messages();
        for envelope in &messages {
            codec.encode(envelope, &mut buf).unwrap();
        }
        for expected in &messages {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn tracing_ids_span_the_whole_u64_range() {
        let codec = ServiceCodec::default();
        for &id in &[0u64, u64::from(u32::MAX) + 17, u64::MAX] {
            let envelope = ServiceEnvelope::new(ServiceMessage::Ping).with_tracing_id(Some(id));
            let mut buf = BytesMut::new();
            codec.encode(&envelope, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.tracing_id, Some(id));
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let codec = ServiceCodec::default();
        let mut buf = BytesMut::new();
        // length 2, tag 200, flags 0
        buf.extend_from_slice(&[2, 200, 0]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_frame_without_buffering_it() {
        let codec = ServiceCodec::new(16);
        let mut buf = BytesMut::new();
        write_varint(1024, &mut buf);
        // The decoder must fail from the prefix alone
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_trailing_garbage_in_body() {
        let codec = ServiceCodec::default();
        let mut buf = BytesMut::new();
        // Ping with one stray byte appended to the body
        buf.extend_from_slice(&[3, TAG_PING, 0, 0xAA]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
