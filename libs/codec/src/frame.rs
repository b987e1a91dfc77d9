//! Correlation wire frames
//!
//! Brokers only move opaque byte buffers, so the correlation id (and, for the
//! raw variant, the reply-route name) travels in a fixed header in front of
//! the payload:
//!
//! ```text
//! typed: [16 bytes correlation id][payload ...]
//! raw:   [16 bytes correlation id][u32 LE name length][name UTF-8][payload ...]
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Size of the correlation id header
pub const CORRELATION_ID_LEN: usize = 16;

/// Size of the reply-name length prefix in raw frames
pub const NAME_LEN_PREFIX: usize = 4;

/// Minimum size of a raw frame
pub const RAW_HEADER_LEN: usize = CORRELATION_ID_LEN + NAME_LEN_PREFIX;

/// 128-bit identifier tying a request to its response
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// Hyphenated lower-case; this is the suffix used in per-correlation reply names.
impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0.hyphenated())
    }
}

/// Which frame layout a route carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameVariant {
    /// Correlation id followed by a serialized envelope
    #[default]
    Typed,
    /// Correlation id, reply-route name, opaque payload
    Raw,
}

/// Decoded typed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

/// Decoded raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub correlation_id: CorrelationId,
    /// Reply-route name, empty when the sender expects no reply
    pub reply_name: String,
    pub payload: Bytes,
}

/// Encode a typed frame
pub fn encode_frame(correlation_id: CorrelationId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CORRELATION_ID_LEN + payload.len());
    buf.put_slice(correlation_id.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a typed frame
///
/// The payload is a zero-copy slice of `buf`.
pub fn decode_frame(buf: &Bytes) -> ProtocolResult<Frame> {
    if buf.len() < CORRELATION_ID_LEN {
        return Err(ProtocolError::message_too_small(
            CORRELATION_ID_LEN,
            buf.len(),
            "typed frame header",
        ));
    }

    Ok(Frame {
        correlation_id: read_correlation_id(buf),
        payload: buf.slice(CORRELATION_ID_LEN..),
    })
}

/// Encode a raw frame carrying the reply-route name
pub fn encode_raw_frame(correlation_id: CorrelationId, reply_name: &str, payload: &[u8]) -> Bytes {
    let name = reply_name.as_bytes();
    let mut buf = BytesMut::with_capacity(RAW_HEADER_LEN + name.len() + payload.len());
    buf.put_slice(correlation_id.as_bytes());
    buf.put_u32_le(name.len() as u32);
    buf.put_slice(name);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a raw frame
pub fn decode_raw_frame(buf: &Bytes) -> ProtocolResult<RawFrame> {
    if buf.len() < RAW_HEADER_LEN {
        return Err(ProtocolError::message_too_small(
            RAW_HEADER_LEN,
            buf.len(),
            "raw frame header",
        ));
    }

    let correlation_id = read_correlation_id(buf);
    let name_len = (&buf[CORRELATION_ID_LEN..RAW_HEADER_LEN]).get_u32_le() as usize;

    let name_end = RAW_HEADER_LEN
        .checked_add(name_len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            ProtocolError::message_too_small(
                RAW_HEADER_LEN.saturating_add(name_len),
                buf.len(),
                "raw frame reply name",
            )
        })?;

    let reply_name = std::str::from_utf8(&buf[RAW_HEADER_LEN..name_end])
        .map_err(|e| ProtocolError::invalid_route_name(e.to_string()))?
        .to_string();

    Ok(RawFrame {
        correlation_id,
        reply_name,
        payload: buf.slice(name_end..),
    })
}

fn read_correlation_id(buf: &[u8]) -> CorrelationId {
    let mut id = [0u8; CORRELATION_ID_LEN];
    id.copy_from_slice(&buf[..CORRELATION_ID_LEN]);
    CorrelationId::from_bytes(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_frame_layout() {
        let id = CorrelationId::new();
        let encoded = encode_frame(id, b"hello");

        assert_eq!(encoded.len(), 21);
        assert_eq!(&encoded[..16], id.as_bytes());
        assert_eq!(&encoded[16..], b"hello");
    }

    #[test]
    fn test_raw_frame_layout() {
        let id = CorrelationId::new();
        let encoded = encode_raw_frame(id, "replies", b"xy");

        assert_eq!(&encoded[16..20], &7u32.to_le_bytes());
        assert_eq!(&encoded[20..27], b"replies");
        assert_eq!(&encoded[27..], b"xy");
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let id = CorrelationId::new();
        let frame = decode_frame(&encode_frame(id, &[])).unwrap();
        assert_eq!(frame.correlation_id, id);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_short_typed_frame_rejected() {
        let err = decode_frame(&Bytes::from_static(&[0u8; 15])).unwrap_err();
        assert_eq!(err, ProtocolError::message_too_small(16, 15, "typed frame header"));
    }

    #[test]
    fn test_short_raw_frame_rejected() {
        let err = decode_raw_frame(&Bytes::from_static(&[0u8; 19])).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooSmall { need: 20, got: 19, .. }));
    }

    #[test]
    fn test_raw_frame_name_overrun_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(CorrelationId::new().as_bytes());
        buf.put_u32_le(100);
        buf.put_slice(b"short");

        let err = decode_raw_frame(&buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooSmall { need: 120, got: 25, .. }));
    }

    #[test]
    fn test_raw_frame_name_length_overflow_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(CorrelationId::new().as_bytes());
        buf.put_u32_le(u32::MAX);

        assert!(decode_raw_frame(&buf.freeze()).is_err());
    }

    #[test]
    fn test_raw_frame_invalid_utf8_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(CorrelationId::new().as_bytes());
        buf.put_u32_le(2);
        buf.put_slice(&[0xff, 0xfe]);

        let err = decode_raw_frame(&buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRouteName { .. }));
    }

    #[test]
    fn test_correlation_id_display_parses_back() {
        let id = CorrelationId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<CorrelationId>().unwrap(), id);
    }
}
