//! # Switchboard Codec
//!
//! Pure, stateless encoding rules shared by every transport:
//!
//! - **Correlation frames**: correlation id (plus reply-route name for the raw
//!   variant) in front of an opaque payload, for brokers that only move bytes
//! - **RPC frames**: length-prefixed, type-tagged messages for the RPC socket
//! - **Serializers**: mime-selected body encoding (JSON, bincode)
//!
//! Nothing here touches the network; transports live in the `network` crate.

pub mod error;
pub mod frame;
pub mod rpc;
pub mod serializer;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    decode_frame, decode_raw_frame, encode_frame, encode_raw_frame, CorrelationId, Frame,
    FrameVariant, RawFrame, CORRELATION_ID_LEN, RAW_HEADER_LEN,
};
pub use rpc::{
    decode_rpc_body, decode_rpc_frame, encode_rpc_frame, EventMessage, PushMessage, RpcMessage,
    RpcMessageType, RpcRequest, RpcResponse, SessionRequest, SessionResponse,
    DEFAULT_MAX_RPC_MESSAGE_SIZE, RPC_LENGTH_PREFIX,
};
pub use serializer::Serializer;
