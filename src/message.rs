// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DoIP message model.
//!
//! A [`DoipMessage`] is the payload type plus the raw payload bytes of one
//! DoIP frame; the 8-byte header only exists on the wire (see
//! [`crate::codec`]). Payload-type-specific fields are exposed through lazy
//! accessors that return `None` when the underlying bytes are too short, so
//! handlers never index out of bounds on malformed input.

use std::fmt;

use thiserror::Error;

use crate::LogicalAddress;

/// Protocol version byte of ISO 13400-2:2019.
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Bitwise inverse of [`PROTOCOL_VERSION`], the second header byte.
pub const INVERSE_PROTOCOL_VERSION: u8 = 0xFD;

/// Size of the generic DoIP header on the wire.
pub const HEADER_LENGTH: usize = 8;

/// Default maximum accepted payload length (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 0x1_0000;

/// Payload types handled by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    GenericHeaderNegativeAck,
    VehicleIdentificationRequest,
    VehicleIdentificationRequestEid,
    VehicleIdentificationRequestVin,
    VehicleIdentificationResponse,
    RoutingActivationRequest,
    RoutingActivationResponse,
    AliveCheckRequest,
    AliveCheckResponse,
    DiagnosticMessage,
    DiagnosticMessagePositiveAck,
    DiagnosticMessageNegativeAck,
}

impl PayloadType {
    /// Decodes the 16-bit wire value, `None` for types outside the handled
    /// set.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(PayloadType::GenericHeaderNegativeAck),
            0x0001 => Some(PayloadType::VehicleIdentificationRequest),
            0x0002 => Some(PayloadType::VehicleIdentificationRequestEid),
            0x0003 => Some(PayloadType::VehicleIdentificationRequestVin),
            0x0004 => Some(PayloadType::VehicleIdentificationResponse),
            0x0005 => Some(PayloadType::RoutingActivationRequest),
            0x0006 => Some(PayloadType::RoutingActivationResponse),
            0x0007 => Some(PayloadType::AliveCheckRequest),
            0x0008 => Some(PayloadType::AliveCheckResponse),
            0x8001 => Some(PayloadType::DiagnosticMessage),
            0x8002 => Some(PayloadType::DiagnosticMessagePositiveAck),
            0x8003 => Some(PayloadType::DiagnosticMessageNegativeAck),
            _ => None,
        }
    }

    /// The 16-bit wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            PayloadType::GenericHeaderNegativeAck => 0x0000,
            PayloadType::VehicleIdentificationRequest => 0x0001,
            PayloadType::VehicleIdentificationRequestEid => 0x0002,
            PayloadType::VehicleIdentificationRequestVin => 0x0003,
            PayloadType::VehicleIdentificationResponse => 0x0004,
            PayloadType::RoutingActivationRequest => 0x0005,
            PayloadType::RoutingActivationResponse => 0x0006,
            PayloadType::AliveCheckRequest => 0x0007,
            PayloadType::AliveCheckResponse => 0x0008,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessagePositiveAck => 0x8002,
            PayloadType::DiagnosticMessageNegativeAck => 0x8003,
        }
    }
}

/// NACK codes of the generic header negative acknowledge (payload type
/// 0x0000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderNackCode {
    IncorrectPatternFormat = 0x00,
    UnknownPayloadType = 0x01,
    MessageTooLarge = 0x02,
    OutOfMemory = 0x03,
    InvalidPayloadLength = 0x04,
}

/// Routing activation response codes. The success code is pinned to the
/// ISO 13400-2:2019 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingActivationResponseCode {
    UnknownSourceAddress = 0x00,
    AllSocketsRegisteredAndActive = 0x02,
    RouteActivated = 0x10,
}

/// Diagnostic message negative acknowledge codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticNackCode {
    InvalidSourceAddress = 0x02,
    UnknownTargetAddress = 0x03,
    DiagnosticMessageTooLarge = 0x04,
    OutOfMemory = 0x05,
    TargetUnreachable = 0x06,
    UnknownNetwork = 0x07,
    TransportProtocolError = 0x08,
}

/// Ack code of a diagnostic message positive acknowledge.
pub const DIAGNOSTIC_POSITIVE_ACK_CODE: u8 = 0x00;

/// Outcome of the diagnostic-message model hook: `None` acknowledges
/// positively, `Some(code)` rejects with that NACK code.
pub type DiagnosticAck = Option<DiagnosticNackCode>;

/// Errors constructing fixed-width identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("VIN must be 17 characters, got {0}")]
    InvalidVinLength(usize),
    #[error("VIN must be ASCII")]
    NonAsciiVin,
    #[error("hardware identifier must be 6 bytes, got {0}")]
    InvalidIdLength(usize),
}

/// Vehicle identification number, 17 ASCII characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vin([u8; 17]);

impl Vin {
    /// The all-zero-bytes VIN used before a real VIN is configured.
    pub const ZERO: Vin = Vin([0; 17]);

    pub fn new(s: &str) -> Result<Self, IdentifierError> {
        if !s.is_ascii() {
            return Err(IdentifierError::NonAsciiVin);
        }
        let bytes = s.as_bytes();
        if bytes.len() != 17 {
            return Err(IdentifierError::InvalidVinLength(bytes.len()));
        }
        let mut vin = [0u8; 17];
        vin.copy_from_slice(bytes);
        Ok(Vin(vin))
    }

    pub fn from_bytes(bytes: [u8; 17]) -> Self {
        Vin(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 17] {
        &self.0
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

macro_rules! hardware_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name([u8; 6]);

        impl $name {
            pub const ZERO: $name = $name([0; 6]);

            pub fn new(bytes: [u8; 6]) -> Self {
                $name(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentifierError> {
                let arr: [u8; 6] = bytes
                    .try_into()
                    .map_err(|_| IdentifierError::InvalidIdLength(bytes.len()))?;
                Ok($name(arr))
            }

            pub fn as_bytes(&self) -> &[u8; 6] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let [a, b, c, d, e, g] = self.0;
                write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
            }
        }
    };
}

hardware_id!(Eid, "Entity identifier, 6 bytes (usually MAC-derived).");
hardware_id!(Gid, "Group identifier, 6 bytes.");

/// One DoIP message: payload type plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipMessage {
    payload_type: PayloadType,
    payload: Vec<u8>,
}

impl DoipMessage {
    pub fn new(payload_type: PayloadType, payload: Vec<u8>) -> Self {
        DoipMessage {
            payload_type,
            payload,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total wire size of the message, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.payload.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Source logical address for payload types that carry one in their
    /// leading two bytes.
    pub fn source_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::RoutingActivationRequest
            | PayloadType::AliveCheckResponse
            | PayloadType::DiagnosticMessage
            | PayloadType::DiagnosticMessagePositiveAck
            | PayloadType::DiagnosticMessageNegativeAck => self.read_u16(0),
            _ => None,
        }
    }

    /// Target logical address of diagnostic-kind payloads.
    pub fn target_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::DiagnosticMessage
            | PayloadType::DiagnosticMessagePositiveAck
            | PayloadType::DiagnosticMessageNegativeAck => self.read_u16(2),
            _ => None,
        }
    }

    /// User data (UDS bytes) of a diagnostic message.
    pub fn user_data(&self) -> Option<&[u8]> {
        match self.payload_type {
            PayloadType::DiagnosticMessage => self.payload.get(4..),
            _ => None,
        }
    }

    /// Activation type byte of a routing activation request.
    pub fn activation_type(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::RoutingActivationRequest => self.payload.get(2).copied(),
            _ => None,
        }
    }

    /// Response code of a routing activation response.
    pub fn routing_activation_result(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::RoutingActivationResponse => self.payload.get(4).copied(),
            _ => None,
        }
    }

    /// Ack code of a diagnostic positive/negative acknowledge.
    pub fn diagnostic_ack_code(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::DiagnosticMessagePositiveAck
            | PayloadType::DiagnosticMessageNegativeAck => self.payload.get(4).copied(),
            _ => None,
        }
    }

    /// NACK code of a generic header negative acknowledge.
    pub fn header_nack_code(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::GenericHeaderNegativeAck => self.payload.first().copied(),
            _ => None,
        }
    }

    /// VIN of a vehicle identification response or VIN-qualified request.
    pub fn vin(&self) -> Option<Vin> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse
            | PayloadType::VehicleIdentificationRequestVin => {
                let bytes: [u8; 17] = self.payload.get(0..17)?.try_into().ok()?;
                Some(Vin::from_bytes(bytes))
            }
            _ => None,
        }
    }

    /// EID of a vehicle identification response or EID-qualified request.
    pub fn eid(&self) -> Option<Eid> {
        let range = match self.payload_type {
            PayloadType::VehicleIdentificationResponse => 19..25,
            PayloadType::VehicleIdentificationRequestEid => 0..6,
            _ => return None,
        };
        Eid::from_slice(self.payload.get(range)?).ok()
    }

    /// GID of a vehicle identification response.
    pub fn gid(&self) -> Option<Gid> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => {
                Gid::from_slice(self.payload.get(25..31)?).ok()
            }
            _ => None,
        }
    }

    /// Logical address announced in a vehicle identification response.
    pub fn logical_address(&self) -> Option<LogicalAddress> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => self.read_u16(17),
            _ => None,
        }
    }

    /// Further-action byte of a vehicle identification response.
    pub fn further_action(&self) -> Option<u8> {
        match self.payload_type {
            PayloadType::VehicleIdentificationResponse => self.payload.get(31).copied(),
            _ => None,
        }
    }
}

impl fmt::Display for DoipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} ({} payload bytes)",
            self.payload_type,
            self.payload.len()
        )
    }
}

fn push_address(payload: &mut Vec<u8>, address: LogicalAddress) {
    payload.extend_from_slice(&address.to_be_bytes());
}

/// Builds a routing activation request (tester side, used by tests and the
/// demo client paths).
pub fn routing_activation_request(source: LogicalAddress) -> DoipMessage {
    let mut payload = Vec::with_capacity(7);
    push_address(&mut payload, source);
    payload.push(0x00); // default activation type
    payload.extend_from_slice(&[0x00; 4]);
    DoipMessage::new(PayloadType::RoutingActivationRequest, payload)
}

/// Builds a routing activation response from the gateway.
pub fn routing_activation_response(
    client: LogicalAddress,
    server: LogicalAddress,
    code: RoutingActivationResponseCode,
) -> DoipMessage {
    let mut payload = Vec::with_capacity(9);
    push_address(&mut payload, client);
    push_address(&mut payload, server);
    payload.push(code as u8);
    payload.extend_from_slice(&[0x00; 4]);
    DoipMessage::new(PayloadType::RoutingActivationResponse, payload)
}

/// Builds an alive check request (empty payload).
pub fn alive_check_request() -> DoipMessage {
    DoipMessage::new(PayloadType::AliveCheckRequest, Vec::new())
}

/// Builds an alive check response carrying the responder's address.
pub fn alive_check_response(source: LogicalAddress) -> DoipMessage {
    let mut payload = Vec::with_capacity(2);
    push_address(&mut payload, source);
    DoipMessage::new(PayloadType::AliveCheckResponse, payload)
}

/// Builds a plain vehicle identification request.
pub fn vehicle_identification_request() -> DoipMessage {
    DoipMessage::new(PayloadType::VehicleIdentificationRequest, Vec::new())
}

/// Builds a vehicle identification request qualified by EID.
pub fn vehicle_identification_request_eid(eid: &Eid) -> DoipMessage {
    DoipMessage::new(
        PayloadType::VehicleIdentificationRequestEid,
        eid.as_bytes().to_vec(),
    )
}

/// Builds a vehicle identification request qualified by VIN.
pub fn vehicle_identification_request_vin(vin: &Vin) -> DoipMessage {
    DoipMessage::new(
        PayloadType::VehicleIdentificationRequestVin,
        vin.as_bytes().to_vec(),
    )
}

/// Builds a vehicle identification response / announcement.
///
/// `sync_status` is appended only when provided, matching the optional
/// trailing byte of the wire format.
pub fn vehicle_identification_response(
    vin: &Vin,
    logical_address: LogicalAddress,
    eid: &Eid,
    gid: &Gid,
    further_action: u8,
    sync_status: Option<u8>,
) -> DoipMessage {
    let mut payload = Vec::with_capacity(33);
    payload.extend_from_slice(vin.as_bytes());
    push_address(&mut payload, logical_address);
    payload.extend_from_slice(eid.as_bytes());
    payload.extend_from_slice(gid.as_bytes());
    payload.push(further_action);
    if let Some(sync) = sync_status {
        payload.push(sync);
    }
    DoipMessage::new(PayloadType::VehicleIdentificationResponse, payload)
}

/// Builds a diagnostic message carrying `user_data`.
pub fn diagnostic_message(
    source: LogicalAddress,
    target: LogicalAddress,
    user_data: &[u8],
) -> DoipMessage {
    let mut payload = Vec::with_capacity(4 + user_data.len());
    push_address(&mut payload, source);
    push_address(&mut payload, target);
    payload.extend_from_slice(user_data);
    DoipMessage::new(PayloadType::DiagnosticMessage, payload)
}

/// Builds a diagnostic message positive acknowledge, optionally echoing the
/// acknowledged message's data.
pub fn diagnostic_positive_ack(
    source: LogicalAddress,
    target: LogicalAddress,
    previous: &[u8],
) -> DoipMessage {
    let mut payload = Vec::with_capacity(5 + previous.len());
    push_address(&mut payload, source);
    push_address(&mut payload, target);
    payload.push(DIAGNOSTIC_POSITIVE_ACK_CODE);
    payload.extend_from_slice(previous);
    DoipMessage::new(PayloadType::DiagnosticMessagePositiveAck, payload)
}

/// Builds a diagnostic message negative acknowledge.
pub fn diagnostic_negative_ack(
    source: LogicalAddress,
    target: LogicalAddress,
    code: DiagnosticNackCode,
) -> DoipMessage {
    let mut payload = Vec::with_capacity(5);
    push_address(&mut payload, source);
    push_address(&mut payload, target);
    payload.push(code as u8);
    DoipMessage::new(PayloadType::DiagnosticMessageNegativeAck, payload)
}

/// Builds a generic header negative acknowledge.
pub fn generic_header_nack(code: HeaderNackCode) -> DoipMessage {
    DoipMessage::new(PayloadType::GenericHeaderNegativeAck, vec![code as u8])
}

/// Builds the diagnostic ack matching a model verdict: positive for `None`,
/// negative with the carried code otherwise.
pub fn diagnostic_ack(
    source: LogicalAddress,
    target: LogicalAddress,
    ack: DiagnosticAck,
) -> DoipMessage {
    match ack {
        None => diagnostic_positive_ack(source, target, &[]),
        Some(code) => diagnostic_negative_ack(source, target, code),
    }
}
