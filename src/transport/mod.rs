// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport variants.
//!
//! Two capability sets, each with a real TCP/UDP implementation and an
//! in-memory test double:
//!
//! - [`ConnectionTransport`] moves whole DoIP messages over one peer link
//!   (single producer for send, single consumer for receive; concurrent
//!   send + receive from different tasks is fine).
//! - [`ServerTransport`] accepts tester connections and owns the UDP
//!   announcement/identification socket.

mod mock;
mod tcp;

use std::net::SocketAddr;

use thiserror::Error;

use crate::codec::CodecError;
use crate::message::DoipMessage;
use crate::CloseReason;

pub use mock::{InMemoryConnectionTransport, InMemoryServerTransport};
pub use tcp::{TcpConnectionTransport, TcpServerTransport};

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not active")]
    Inactive,

    #[error("transport has not been set up")]
    NotReady,

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("permission denied binding port {0}")]
    PermissionDenied(u16),

    #[error("encoding failed: {0}")]
    Encode(#[source] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn from_bind_error(err: std::io::Error, port: u16) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => TransportError::PortInUse(port),
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(port),
            _ => TransportError::Io(err),
        }
    }
}

/// Per-connection transport: one tester link.
///
/// `receive_message` distinguishes three outcomes: `Ok(Some(_))` a complete
/// message, `Ok(None)` the link is gone (peer close, I/O error, or local
/// close), `Err(_)` a framing violation the state machine may still answer
/// before tearing the connection down.
pub enum ConnectionTransport {
    Tcp(TcpConnectionTransport),
    InMemory(InMemoryConnectionTransport),
}

impl ConnectionTransport {
    /// Sends one message; returns the number of wire bytes written.
    pub async fn send_message(&self, msg: &DoipMessage) -> Result<usize, TransportError> {
        match self {
            ConnectionTransport::Tcp(t) => t.send_message(msg).await,
            ConnectionTransport::InMemory(t) => t.send_message(msg).await,
        }
    }

    /// Blocks until a complete message arrives, the peer closes, or the
    /// transport is closed locally.
    pub async fn receive_message(&self) -> Result<Option<DoipMessage>, CodecError> {
        match self {
            ConnectionTransport::Tcp(t) => t.receive_message().await,
            ConnectionTransport::InMemory(t) => t.receive_message().await,
        }
    }

    /// Closes the link; idempotent, wakes a blocked receiver.
    pub fn close(&self, reason: CloseReason) {
        match self {
            ConnectionTransport::Tcp(t) => t.close(reason),
            ConnectionTransport::InMemory(t) => t.close(reason),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ConnectionTransport::Tcp(t) => t.is_active(),
            ConnectionTransport::InMemory(t) => t.is_active(),
        }
    }

    /// Peer identification for logs.
    pub fn identifier(&self) -> String {
        match self {
            ConnectionTransport::Tcp(t) => t.identifier().to_owned(),
            ConnectionTransport::InMemory(t) => t.identifier().to_owned(),
        }
    }
}

/// Server-side transport: TCP acceptance plus the UDP discovery socket.
pub enum ServerTransport {
    Tcp(TcpServerTransport),
    InMemory(InMemoryServerTransport),
}

impl ServerTransport {
    /// Binds the TCP listener and the UDP socket; marks the transport
    /// active. Fails with [`TransportError::PortInUse`] or
    /// [`TransportError::PermissionDenied`].
    pub async fn setup(&self, tcp_port: u16) -> Result<(), TransportError> {
        match self {
            ServerTransport::Tcp(t) => t.setup(tcp_port).await,
            ServerTransport::InMemory(t) => t.setup(tcp_port),
        }
    }

    /// Waits up to ~100 ms for a pending connection; `None` when nothing
    /// arrived in that window.
    pub async fn accept_connection(&self) -> Option<ConnectionTransport> {
        match self {
            ServerTransport::Tcp(t) => t.accept_connection().await,
            ServerTransport::InMemory(t) => t.accept_connection().await,
        }
    }

    /// Sends an announcement datagram: to 127.0.0.1 in loopback mode,
    /// otherwise to the limited broadcast address.
    pub async fn send_broadcast(
        &self,
        msg: &DoipMessage,
        port: u16,
    ) -> Result<usize, TransportError> {
        match self {
            ServerTransport::Tcp(t) => t.send_broadcast(msg, port).await,
            ServerTransport::InMemory(t) => t.send_broadcast(msg, port),
        }
    }

    /// Receives one datagram from the UDP socket; undecodable payloads come
    /// back as `Err` alongside the sender so the caller can NACK them.
    /// `None` once the transport is closed.
    pub async fn receive_datagram(&self) -> Option<(Result<DoipMessage, CodecError>, SocketAddr)> {
        match self {
            ServerTransport::Tcp(t) => t.receive_datagram().await,
            ServerTransport::InMemory(t) => t.receive_datagram().await,
        }
    }

    /// Sends a unicast reply datagram.
    pub async fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        match self {
            ServerTransport::Tcp(t) => t.send_datagram(msg, dest).await,
            ServerTransport::InMemory(t) => t.send_datagram(msg, dest),
        }
    }

    /// Releases both sockets; idempotent.
    pub async fn close(&self) {
        match self {
            ServerTransport::Tcp(t) => t.close().await,
            ServerTransport::InMemory(t) => t.close(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ServerTransport::Tcp(t) => t.is_active(),
            ServerTransport::InMemory(t) => t.is_active(),
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            ServerTransport::Tcp(t) => t.identifier(),
            ServerTransport::InMemory(t) => t.identifier(),
        }
    }

    /// Local address of the bound TCP listener (ephemeral-port tests).
    pub async fn local_tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerTransport::Tcp(t) => t.local_tcp_addr().await,
            ServerTransport::InMemory(_) => None,
        }
    }

    /// Local address of the bound UDP socket (ephemeral-port tests).
    pub async fn local_udp_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerTransport::Tcp(t) => t.local_udp_addr().await,
            ServerTransport::InMemory(_) => None,
        }
    }
}
