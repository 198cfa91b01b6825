// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DoIP (ISO 13400-2) gateway server.
//!
//! The crate implements the transport between a diagnostic tester and an
//! in-vehicle gateway: a TCP listener for tester connections, UDP vehicle
//! announcements and identification responses, the per-connection DoIP state
//! machine with its inactivity/alive-check timing rules, and a pluggable
//! downstream contract for forwarding accepted diagnostic payloads to a lower
//! protocol stack (e.g. UDS over CAN ISO-TP).
//!
//! The building blocks compose like this: a [`server::DoipServer`] owns a
//! [`transport::ServerTransport`] and a shared [`timer::TimerManager`]. Each
//! accepted tester connection gets its own [`connection::Connection`] state
//! machine fed by a single event channel; incoming frames, timer expiries and
//! downstream responses all arrive as [`connection::ConnectionEvent`]s, so
//! message handling is serialized per connection without explicit locking.
//! Application policy lives in a [`model::ServerModel`] produced per
//! connection by a factory.

use std::fmt;

pub mod codec;
pub mod config;
pub mod connection;
pub mod downstream;
pub mod message;
pub mod model;
pub mod server;
pub mod timer;
pub mod transport;

pub use config::{GatewayConfig, ServerConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState, TimerRole};
pub use downstream::{DownstreamProvider, DownstreamResponse, DownstreamStatus};
pub use message::{DoipMessage, Eid, Gid, PayloadType, Vin};
pub use model::{DefaultServerModel, DownstreamServerModel, ServerModel};
pub use server::DoipServer;

/// 16-bit DoIP logical address of a node (tester or ECU).
pub type LogicalAddress = u16;

/// Reserved "zero/unset" logical address.
pub const ZERO_ADDRESS: LogicalAddress = 0x0000;

/// First address of the external-tester pool.
pub const TESTER_ADDRESS_MIN: LogicalAddress = 0x0E00;

/// Last address of the external-tester pool.
pub const TESTER_ADDRESS_MAX: LogicalAddress = 0x0FFF;

/// TCP port a DoIP entity listens on for tester connections.
pub const DOIP_SERVER_TCP_PORT: u16 = 13400;

/// UDP port the discovery/announcement socket binds to.
pub const DOIP_UDP_DISCOVERY_PORT: u16 = 13400;

/// UDP port of the test equipment, the destination of vehicle announcements.
pub const DOIP_UDP_TEST_EQUIPMENT_REQUEST_PORT: u16 = 13400;

/// Whether `address` falls into the external-tester pool accepted for routing
/// activation.
pub fn is_tester_address(address: LogicalAddress) -> bool {
    (TESTER_ADDRESS_MIN..=TESTER_ADDRESS_MAX).contains(&address)
}

/// Why a connection (or its transport) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The application asked for the close (server stop, model request).
    ApplicationRequest,
    /// The peer closed the socket or an I/O error ended the stream.
    SocketError,
    /// A frame violated the protocol in a way the connection cannot recover
    /// from.
    InvalidMessage,
    /// No routing activation request arrived within the initial window.
    InitialInactivityTimeout,
    /// The tester did not answer the alive check in time.
    AliveCheckTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ApplicationRequest => "application request",
            CloseReason::SocketError => "socket error",
            CloseReason::InvalidMessage => "invalid message",
            CloseReason::InitialInactivityTimeout => "initial inactivity timeout",
            CloseReason::AliveCheckTimeout => "alive check timeout",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tester_pool_bounds() {
        assert!(!is_tester_address(0x0DFF));
        assert!(is_tester_address(0x0E00));
        assert!(is_tester_address(0x0FFF));
        assert!(!is_tester_address(0x1000));
        assert!(!is_tester_address(ZERO_ADDRESS));
    }
}
