// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Property-based robustness tests for the frame codec: arbitrary byte
//! soup must never panic the parser, and well-formed messages round-trip
//! bit-exactly.

use proptest::prelude::*;

use doip_gateway::codec::{encode_message, parse_message, CodecError};
use doip_gateway::message::{DoipMessage, PayloadType, HEADER_LENGTH};

fn any_payload_type() -> impl Strategy<Value = PayloadType> {
    prop::sample::select(vec![
        PayloadType::GenericHeaderNegativeAck,
        PayloadType::VehicleIdentificationRequest,
        PayloadType::VehicleIdentificationRequestEid,
        PayloadType::VehicleIdentificationRequestVin,
        PayloadType::VehicleIdentificationResponse,
        PayloadType::RoutingActivationRequest,
        PayloadType::RoutingActivationResponse,
        PayloadType::AliveCheckRequest,
        PayloadType::AliveCheckResponse,
        PayloadType::DiagnosticMessage,
        PayloadType::DiagnosticMessagePositiveAck,
        PayloadType::DiagnosticMessageNegativeAck,
    ])
}

proptest! {
    /// The parser is total: any input yields Ok or Err, never a panic.
    #[test]
    fn parse_never_panics(input in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_message(&input);
    }

    /// encode → parse reproduces the message exactly.
    #[test]
    fn encode_parse_roundtrip(
        payload_type in any_payload_type(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let msg = DoipMessage::new(payload_type, payload);
        let parsed = parse_message(&encode_message(&msg)).expect("own encoding parses");
        prop_assert_eq!(parsed, msg);
    }

    /// Any corruption of the first two header bytes is caught.
    #[test]
    fn corrupt_protocol_bytes_fail(
        payload_type in any_payload_type(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
        version in any::<u8>(),
        inverse in any::<u8>(),
    ) {
        prop_assume!(version != 0x02 || inverse != 0xFD);
        let mut wire = encode_message(&DoipMessage::new(payload_type, payload));
        wire[0] = version;
        wire[1] = inverse;
        let is_invalid_protocol_version = matches!(
            parse_message(&wire),
            Err(CodecError::InvalidProtocolVersion { .. })
        );
        prop_assert!(is_invalid_protocol_version);
    }

    /// Truncating a frame anywhere is rejected, never mis-parsed.
    #[test]
    fn truncation_is_rejected(
        payload_type in any_payload_type(),
        payload in prop::collection::vec(any::<u8>(), 1..64),
        cut in any::<prop::sample::Index>(),
    ) {
        let wire = encode_message(&DoipMessage::new(payload_type, payload));
        let cut = cut.index(wire.len() - 1);
        prop_assert!(parse_message(&wire[..cut]).is_err());
    }
}

#[test]
fn header_length_constant_matches_wire() {
    let wire = encode_message(&doip_gateway::message::alive_check_request());
    assert_eq!(wire.len(), HEADER_LENGTH);
}
