//! Message body serializers selected by mime type

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub const JSON_MIME: &str = "application/json";
pub const BINCODE_MIME: &str = "application/x-bincode";
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// Pluggable body serializer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    #[default]
    Json,
    Bincode,
}

impl Serializer {
    /// Resolve a serializer from a mime type, ignoring parameters and case
    pub fn from_mime(mime: &str) -> ProtocolResult<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            JSON_MIME => Ok(Serializer::Json),
            BINCODE_MIME | OCTET_STREAM_MIME => Ok(Serializer::Bincode),
            _ => Err(ProtocolError::unsupported_mime_type(mime)),
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Serializer::Json => JSON_MIME,
            Serializer::Bincode => BINCODE_MIME,
        }
    }

    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> ProtocolResult<Bytes> {
        let bytes = match self {
            Serializer::Json => serde_json::to_vec(value)?,
            Serializer::Bincode => bincode::serialize(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> ProtocolResult<T> {
        match self {
            Serializer::Json => Ok(serde_json::from_slice(bytes)?),
            Serializer::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }
}

impl FromStr for Serializer {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Serializer::from_mime(s)
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}
