// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DoIP frame codec.
//!
//! The generic header is 8 bytes on the wire: protocol version, inverse
//! protocol version, payload type (big-endian u16) and payload length
//! (big-endian u32), followed by the payload. [`DoipCodec`] plugs into
//! `tokio_util`'s framed reader/writer so the TCP transport deals in whole
//! [`DoipMessage`]s; the free functions parse and encode self-contained
//! buffers (UDP datagrams, tests).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{
    DoipMessage, HeaderNackCode, PayloadType, DEFAULT_MAX_PAYLOAD, HEADER_LENGTH,
    INVERSE_PROTOCOL_VERSION, PROTOCOL_VERSION,
};

/// Errors raised while parsing or framing DoIP messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid protocol version {version:#04x} (inverse {inverse:#04x})")]
    InvalidProtocolVersion { version: u8, inverse: u8 },

    #[error("unknown payload type {0:#06x}")]
    UnknownPayloadType(u16),

    #[error("payload length {length} exceeds maximum {max}")]
    PayloadLengthExceedsMax { length: usize, max: usize },

    #[error("payload length mismatch: header announces {expected}, buffer carries {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },

    #[error("truncated header: {0} of {HEADER_LENGTH} bytes")]
    TruncatedHeader(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// The generic-header NACK code reported back to the peer for this error.
    pub fn header_nack_code(&self) -> HeaderNackCode {
        match self {
            CodecError::InvalidProtocolVersion { .. } => HeaderNackCode::IncorrectPatternFormat,
            CodecError::UnknownPayloadType(_) => HeaderNackCode::UnknownPayloadType,
            CodecError::PayloadLengthExceedsMax { .. } => HeaderNackCode::MessageTooLarge,
            CodecError::PayloadLengthMismatch { .. } => HeaderNackCode::InvalidPayloadLength,
            CodecError::TruncatedHeader(_) => HeaderNackCode::IncorrectPatternFormat,
            CodecError::Io(_) => HeaderNackCode::IncorrectPatternFormat,
        }
    }
}

/// Encodes a message into one contiguous wire buffer.
pub fn encode_message(msg: &DoipMessage) -> Vec<u8> {
    let payload = msg.payload();
    let mut out = Vec::with_capacity(HEADER_LENGTH + payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(INVERSE_PROTOCOL_VERSION);
    out.extend_from_slice(&msg.payload_type().to_u16().to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validates the 8-byte generic header and returns payload type and length.
pub fn parse_header(buf: &[u8], max_payload: usize) -> Result<(PayloadType, usize), CodecError> {
    if buf.len() < HEADER_LENGTH {
        return Err(CodecError::TruncatedHeader(buf.len()));
    }
    let version = buf[0];
    let inverse = buf[1];
    if version != PROTOCOL_VERSION || inverse != INVERSE_PROTOCOL_VERSION {
        return Err(CodecError::InvalidProtocolVersion { version, inverse });
    }
    let raw_type = u16::from_be_bytes([buf[2], buf[3]]);
    let payload_type =
        PayloadType::from_u16(raw_type).ok_or(CodecError::UnknownPayloadType(raw_type))?;
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if length > max_payload {
        return Err(CodecError::PayloadLengthExceedsMax {
            length,
            max: max_payload,
        });
    }
    Ok((payload_type, length))
}

/// Parses one complete message from a self-contained buffer. The buffer must
/// hold exactly header plus announced payload.
pub fn parse_message(buf: &[u8]) -> Result<DoipMessage, CodecError> {
    parse_message_limited(buf, DEFAULT_MAX_PAYLOAD)
}

/// [`parse_message`] with an explicit payload-length ceiling.
pub fn parse_message_limited(buf: &[u8], max_payload: usize) -> Result<DoipMessage, CodecError> {
    let (payload_type, length) = parse_header(buf, max_payload)?;
    let actual = buf.len() - HEADER_LENGTH;
    if actual != length {
        return Err(CodecError::PayloadLengthMismatch {
            expected: length,
            actual,
        });
    }
    Ok(DoipMessage::new(
        payload_type,
        buf[HEADER_LENGTH..].to_vec(),
    ))
}

/// Stream codec framing DoIP messages, with a configurable payload ceiling.
#[derive(Debug, Clone)]
pub struct DoipCodec {
    max_payload: usize,
}

impl DoipCodec {
    pub fn new(max_payload: usize) -> Self {
        DoipCodec { max_payload }
    }
}

impl Default for DoipCodec {
    fn default() -> Self {
        DoipCodec::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for DoipCodec {
    type Item = DoipMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DoipMessage>, CodecError> {
        if src.len() < HEADER_LENGTH {
            src.reserve(HEADER_LENGTH - src.len());
            return Ok(None);
        }
        let (payload_type, length) = parse_header(&src[..HEADER_LENGTH], self.max_payload)?;
        let frame_len = HEADER_LENGTH + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LENGTH);
        let payload = src.split_to(length).to_vec();
        Ok(Some(DoipMessage::new(payload_type, payload)))
    }
}

impl Encoder<&DoipMessage> for DoipCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: &DoipMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = msg.payload();
        dst.reserve(HEADER_LENGTH + payload.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(INVERSE_PROTOCOL_VERSION);
        dst.put_u16(msg.payload_type().to_u16());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}

impl Encoder<DoipMessage> for DoipCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: DoipMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        Encoder::<&DoipMessage>::encode(self, &msg, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;

    #[test]
    fn encode_routing_activation_request_wire_bytes() {
        let msg = message::routing_activation_request(0x0E00);
        let wire = encode_message(&msg);
        assert_eq!(
            wire,
            vec![
                0x02, 0xFD, 0x00, 0x05, 0x00, 0x00, 0x00, 0x07, // header
                0x0E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // payload
            ]
        );
    }

    #[test]
    fn parse_encode_roundtrip() {
        let messages = [
            message::alive_check_request(),
            message::alive_check_response(0x0E00),
            message::routing_activation_request(0x0E42),
            message::diagnostic_message(0x0E00, 0x0201, &[0x22, 0xF1, 0x90]),
            message::generic_header_nack(HeaderNackCode::MessageTooLarge),
        ];
        for msg in messages {
            let parsed = parse_message(&encode_message(&msg)).expect("roundtrip parse");
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn header_rejects_wrong_version() {
        let mut wire = encode_message(&message::alive_check_request());
        wire[0] = 0x01;
        assert!(matches!(
            parse_header(&wire, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::InvalidProtocolVersion {
                version: 0x01,
                inverse: 0xFD
            })
        ));
    }

    #[test]
    fn header_rejects_wrong_inverse() {
        let mut wire = encode_message(&message::alive_check_request());
        wire[1] = 0xFE;
        assert!(matches!(
            parse_header(&wire, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::InvalidProtocolVersion { .. })
        ));
    }

    #[test]
    fn header_rejects_unknown_payload_type() {
        let wire = [0x02, 0xFD, 0x80, 0x04, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            parse_header(&wire, DEFAULT_MAX_PAYLOAD),
            Err(CodecError::UnknownPayloadType(0x8004))
        ));
    }

    #[test]
    fn payload_length_boundaries() {
        // Zero payload is allowed.
        let empty = encode_message(&message::alive_check_request());
        assert!(parse_message(&empty).is_ok());

        // Exactly at the ceiling.
        let max = 32;
        let at_limit = message::DoipMessage::new(PayloadType::DiagnosticMessage, vec![0u8; max]);
        let wire = encode_message(&at_limit);
        assert!(parse_message_limited(&wire, max).is_ok());

        // One byte over.
        let over = message::DoipMessage::new(PayloadType::DiagnosticMessage, vec![0u8; max + 1]);
        let wire = encode_message(&over);
        assert!(matches!(
            parse_message_limited(&wire, max),
            Err(CodecError::PayloadLengthExceedsMax { length, max: m }) if length == max + 1 && m == max
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut wire = encode_message(&message::alive_check_response(0x0E00));
        wire.push(0xAA);
        assert!(matches!(
            parse_message(&wire),
            Err(CodecError::PayloadLengthMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn decoder_handles_fragmented_input() {
        let mut codec = DoipCodec::default();
        let wire = encode_message(&message::diagnostic_message(0x0E00, 0x0201, &[0x10, 0x03]));
        let mut buf = BytesMut::new();

        // Byte-by-byte feeding never yields a partial message.
        for &b in &wire[..wire.len() - 1] {
            buf.put_u8(b);
            assert!(codec.decode(&mut buf).expect("partial decode").is_none());
        }
        buf.put_u8(wire[wire.len() - 1]);
        let msg = codec.decode(&mut buf).expect("decode").expect("message");
        assert_eq!(msg.payload_type(), PayloadType::DiagnosticMessage);
        assert_eq!(msg.user_data(), Some(&[0x10, 0x03][..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_yields_back_to_back_frames() {
        let mut codec = DoipCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(&message::alive_check_request(), &mut buf)
            .unwrap();
        codec
            .encode(&message::alive_check_response(0x0E01), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload_type(), PayloadType::AliveCheckRequest);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.payload_type(), PayloadType::AliveCheckResponse);
        assert_eq!(second.source_address(), Some(0x0E01));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn nack_code_mapping() {
        let err = parse_header(&[0x03, 0xFC, 0, 1, 0, 0, 0, 0], DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert_eq!(
            err.header_nack_code(),
            HeaderNackCode::IncorrectPatternFormat
        );

        let err = parse_header(&[0x02, 0xFD, 0x12, 0x34, 0, 0, 0, 0], DEFAULT_MAX_PAYLOAD)
            .unwrap_err();
        assert_eq!(err.header_nack_code(), HeaderNackCode::UnknownPayloadType);

        let err = parse_header(
            &[0x02, 0xFD, 0x80, 0x01, 0xFF, 0xFF, 0xFF, 0xFF],
            DEFAULT_MAX_PAYLOAD,
        )
        .unwrap_err();
        assert_eq!(err.header_nack_code(), HeaderNackCode::MessageTooLarge);
    }
}
