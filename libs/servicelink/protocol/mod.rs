//! Service protocol: wire envelope, varint framing and codecs.

pub mod codec;
pub mod message;
pub mod text;
pub mod varint;

pub use codec::{ServiceCodec, DEFAULT_MAX_FRAME_SIZE};
pub use message::{
    AckStatus, HandshakeError, HandshakeErrorKind, ServiceEnvelope, ServiceMessage,
};
pub use text::{TextCodec, RECORD_SEPARATOR};
