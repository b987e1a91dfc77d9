//! Protocol-level errors for frame processing
//!
//! Every decode path validates buffer lengths before touching the bytes it
//! needs, and reports what it expected alongside what it actually got.

use thiserror::Error;

/// Framing and serialization errors with diagnostic context
///
/// These are never retried: a malformed buffer is a defect on the sending
/// side, so callers drop the message and log the error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer is too small to contain the expected header
    #[error("Message too small: need {need} bytes, got {got} (context: {context})")]
    MessageTooSmall {
        need: usize,
        got: usize,
        context: String,
    },

    /// Reply-route name inside a raw frame is not valid UTF-8
    #[error("Invalid route name in frame: {reason}")]
    InvalidRouteName { reason: String },

    /// Frame exceeds the configured maximum
    #[error("Message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// RPC type tag is not one of the known message kinds
    #[error("Unknown message type tag {tag}")]
    UnknownMessageType { tag: u8 },

    /// Body could not be encoded or decoded
    #[error("Serialization failed ({format}): {message}")]
    Serialization { format: String, message: String },

    /// No serializer is registered for the configured mime type
    #[error("Unsupported mime type '{mime}': expected application/json, application/x-bincode or application/octet-stream")]
    UnsupportedMimeType { mime: String },
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    pub fn message_too_small(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::MessageTooSmall {
            need,
            got,
            context: context.into(),
        }
    }

    pub fn invalid_route_name(reason: impl Into<String>) -> Self {
        Self::InvalidRouteName {
            reason: reason.into(),
        }
    }

    pub fn message_too_large(size: usize, max: usize) -> Self {
        Self::MessageTooLarge { size, max }
    }

    pub fn serialization(format: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            format: format.into(),
            message: message.to_string(),
        }
    }

    pub fn unsupported_mime_type(mime: impl Into<String>) -> Self {
        Self::UnsupportedMimeType { mime: mime.into() }
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(error: bincode::Error) -> Self {
        ProtocolError::serialization("bincode", error)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        ProtocolError::serialization("json", error)
    }
}
