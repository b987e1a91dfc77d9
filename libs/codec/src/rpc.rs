//! RPC socket message format
//!
//! Each message on the socket is a length-prefixed, type-tagged frame:
//!
//! ```text
//! [u32 LE length of (tag + body)][u8 type tag][bincode body]
//! ```
//!
//! Ping and Pong carry no body.

use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::CorrelationId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Length prefix size
pub const RPC_LENGTH_PREFIX: usize = 4;

/// Default ceiling for a single RPC frame
pub const DEFAULT_MAX_RPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Wire tags for each message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcMessageType {
    SessionRequest = 1,
    SessionResponse = 2,
    Request = 3,
    Response = 4,
    Event = 5,
    Push = 6,
    Ping = 7,
    Pong = 8,
}

impl TryFrom<u8> for RpcMessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::SessionRequest,
            2 => Self::SessionResponse,
            3 => Self::Request,
            4 => Self::Response,
            5 => Self::Event,
            6 => Self::Push,
            7 => Self::Ping,
            8 => Self::Pong,
            _ => return Err(ProtocolError::UnknownMessageType { tag }),
        })
    }
}

/// Opens a session; must be the first message a client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub message_id: CorrelationId,
    pub hub: String,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Echoes the request's `message_id`
    pub message_id: CorrelationId,
    pub session_id: CorrelationId,
    pub hub: String,
    pub accepted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub message_id: CorrelationId,
    pub method: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoes the request's `message_id`
    pub message_id: CorrelationId,
    pub payload: Vec<u8>,
    /// Set when the remote handler failed
    pub error: Option<String>,
}

/// Named server-initiated notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub message_id: CorrelationId,
    pub name: String,
    pub payload: Vec<u8>,
}

/// Unnamed server-initiated payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub message_id: CorrelationId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    SessionRequest(SessionRequest),
    SessionResponse(SessionResponse),
    Request(RpcRequest),
    Response(RpcResponse),
    Event(EventMessage),
    Push(PushMessage),
    Ping,
    Pong,
}

impl RpcMessage {
    pub fn message_type(&self) -> RpcMessageType {
        match self {
            RpcMessage::SessionRequest(_) => RpcMessageType::SessionRequest,
            RpcMessage::SessionResponse(_) => RpcMessageType::SessionResponse,
            RpcMessage::Request(_) => RpcMessageType::Request,
            RpcMessage::Response(_) => RpcMessageType::Response,
            RpcMessage::Event(_) => RpcMessageType::Event,
            RpcMessage::Push(_) => RpcMessageType::Push,
            RpcMessage::Ping => RpcMessageType::Ping,
            RpcMessage::Pong => RpcMessageType::Pong,
        }
    }

    /// Message id, if this kind carries one
    pub fn message_id(&self) -> Option<CorrelationId> {
        match self {
            RpcMessage::SessionRequest(m) => Some(m.message_id),
            RpcMessage::SessionResponse(m) => Some(m.message_id),
            RpcMessage::Request(m) => Some(m.message_id),
            RpcMessage::Response(m) => Some(m.message_id),
            RpcMessage::Event(m) => Some(m.message_id),
            RpcMessage::Push(m) => Some(m.message_id),
            RpcMessage::Ping | RpcMessage::Pong => None,
        }
    }

    fn encode_body(&self) -> ProtocolResult<Vec<u8>> {
        let body = match self {
            RpcMessage::SessionRequest(m) => bincode::serialize(m)?,
            RpcMessage::SessionResponse(m) => bincode::serialize(m)?,
            RpcMessage::Request(m) => bincode::serialize(m)?,
            RpcMessage::Response(m) => bincode::serialize(m)?,
            RpcMessage::Event(m) => bincode::serialize(m)?,
            RpcMessage::Push(m) => bincode::serialize(m)?,
            RpcMessage::Ping | RpcMessage::Pong => Vec::new(),
        };
        Ok(body)
    }
}

/// Encode a complete frame including the length prefix
pub fn encode_rpc_frame(message: &RpcMessage) -> ProtocolResult<Bytes> {
    let body = message.encode_body()?;
    let frame_len = 1 + body.len();

    let mut buf = BytesMut::with_capacity(RPC_LENGTH_PREFIX + frame_len);
    buf.put_u32_le(frame_len as u32);
    buf.put_u8(message.message_type() as u8);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode the part of a frame following the length prefix
pub fn decode_rpc_body(tag: u8, body: &[u8]) -> ProtocolResult<RpcMessage> {
    let message = match RpcMessageType::try_from(tag)? {
        RpcMessageType::SessionRequest => RpcMessage::SessionRequest(bincode::deserialize(body)?),
        RpcMessageType::SessionResponse => {
            RpcMessage::SessionResponse(bincode::deserialize(body)?)
        }
        RpcMessageType::Request => RpcMessage::Request(bincode::deserialize(body)?),
        RpcMessageType::Response => RpcMessage::Response(bincode::deserialize(body)?),
        RpcMessageType::Event => RpcMessage::Event(bincode::deserialize(body)?),
        RpcMessageType::Push => RpcMessage::Push(bincode::deserialize(body)?),
        RpcMessageType::Ping => RpcMessage::Ping,
        RpcMessageType::Pong => RpcMessage::Pong,
    };
    Ok(message)
}

/// Decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, otherwise
/// the message and the number of bytes it consumed.
pub fn decode_rpc_frame(
    buf: &[u8],
    max_message_size: usize,
) -> ProtocolResult<Option<(RpcMessage, usize)>> {
    if buf.len() < RPC_LENGTH_PREFIX {
        return Ok(None);
    }

    let mut prefix = [0u8; RPC_LENGTH_PREFIX];
    prefix.copy_from_slice(&buf[..RPC_LENGTH_PREFIX]);
    let frame_len = u32::from_le_bytes(prefix) as usize;

    if frame_len == 0 {
        return Err(ProtocolError::message_too_small(1, 0, "rpc frame type tag"));
    }
    if frame_len > max_message_size {
        return Err(ProtocolError::message_too_large(frame_len, max_message_size));
    }

    let total = RPC_LENGTH_PREFIX + frame_len;
    if buf.len() < total {
        return Ok(None);
    }

    let tag = buf[RPC_LENGTH_PREFIX];
    let message = decode_rpc_body(tag, &buf[RPC_LENGTH_PREFIX + 1..total])?;
    Ok(Some((message, total)))
}
