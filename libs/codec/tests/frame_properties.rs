//! Property tests for the wire frame codecs
//!
//! Any correlation id, reply name and payload (including empty ones) must
//! survive encode followed by decode unchanged, and truncated buffers must be
//! rejected rather than misread.

use bytes::Bytes;
use codec::{
    decode_frame, decode_raw_frame, decode_rpc_frame, encode_frame, encode_raw_frame,
    encode_rpc_frame, CorrelationId, EventMessage, RpcMessage, DEFAULT_MAX_RPC_MESSAGE_SIZE,
};
use proptest::prelude::*;

fn correlation_id() -> impl Strategy<Value = CorrelationId> {
    any::<[u8; 16]>().prop_map(CorrelationId::from_bytes)
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn typed_frame_round_trips(id in correlation_id(), body in payload()) {
        let frame = decode_frame(&encode_frame(id, &body)).unwrap();
        prop_assert_eq!(frame.correlation_id, id);
        prop_assert_eq!(&frame.payload[..], &body[..]);
    }

    #[test]
    fn raw_frame_round_trips(id in correlation_id(), name in ".{0,64}", body in payload()) {
        let frame = decode_raw_frame(&encode_raw_frame(id, &name, &body)).unwrap();
        prop_assert_eq!(frame.correlation_id, id);
        prop_assert_eq!(frame.reply_name, name);
        prop_assert_eq!(&frame.payload[..], &body[..]);
    }

    #[test]
    fn truncated_raw_header_never_decodes(id in correlation_id(), name in "[a-z_]{1,32}", cut in 0usize..20) {
        let encoded = encode_raw_frame(id, &name, b"payload");
        let truncated = Bytes::copy_from_slice(&encoded[..cut]);
        prop_assert!(decode_raw_frame(&truncated).is_err());
    }

    #[test]
    fn rpc_event_round_trips(id in correlation_id(), name in "[a-z.]{0,24}", body in payload()) {
        let message = RpcMessage::Event(EventMessage { message_id: id, name, payload: body });
        let encoded = encode_rpc_frame(&message).unwrap();
        let (decoded, used) = decode_rpc_frame(&encoded, DEFAULT_MAX_RPC_MESSAGE_SIZE).unwrap().unwrap();
        prop_assert_eq!(used, encoded.len());
        prop_assert_eq!(decoded, message);
    }
}
