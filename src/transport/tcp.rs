// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Real TCP/UDP transports.
//!
//! The connection transport wraps one accepted stream, split into framed
//! halves so a reader task can block in `receive_message` while the state
//! machine sends responses. The server transport owns the listening socket
//! and the UDP discovery/announcement socket; socket options (address reuse,
//! broadcast, multicast membership) are applied with `socket2` before the
//! sockets are handed to tokio.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{encode_message, parse_message_limited, CodecError, DoipCodec};
use crate::message::DoipMessage;
use crate::transport::{ConnectionTransport, TransportError};
use crate::CloseReason;

const ACCEPT_WAIT: Duration = Duration::from_millis(100);
const ANNOUNCEMENT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
const MAX_DATAGRAM: usize = 4096;

/// One accepted tester link, framed with [`DoipCodec`].
pub struct TcpConnectionTransport {
    reader: Mutex<FramedRead<OwnedReadHalf, DoipCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, DoipCodec>>,
    active: AtomicBool,
    closed: Notify,
    identifier: String,
}

impl TcpConnectionTransport {
    pub fn new(stream: TcpStream, max_payload: usize) -> Self {
        let identifier = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp-peer-unknown".to_owned());
        let (read_half, write_half) = stream.into_split();
        debug!(target: "doip::transport", "connection transport created for {identifier}");
        TcpConnectionTransport {
            reader: Mutex::new(FramedRead::new(read_half, DoipCodec::new(max_payload))),
            writer: Mutex::new(FramedWrite::new(write_half, DoipCodec::new(max_payload))),
            active: AtomicBool::new(true),
            closed: Notify::new(),
            identifier,
        }
    }

    pub async fn send_message(&self, msg: &DoipMessage) -> Result<usize, TransportError> {
        if !self.is_active() {
            warn!(
                target: "doip::transport",
                "send on closed transport {}", self.identifier
            );
            return Err(TransportError::Inactive);
        }
        let mut writer = self.writer.lock().await;
        match writer.send(msg).await {
            Ok(()) => {
                trace!(
                    target: "doip::transport",
                    "sent {} bytes on {}", msg.wire_len(), self.identifier
                );
                Ok(msg.wire_len())
            }
            Err(err) => {
                warn!(
                    target: "doip::transport",
                    "send failed on {}: {err}", self.identifier
                );
                self.active.store(false, Ordering::SeqCst);
                self.closed.notify_one();
                match err {
                    CodecError::Io(io) => Err(TransportError::Io(io)),
                    other => Err(TransportError::Encode(other)),
                }
            }
        }
    }

    pub async fn receive_message(&self) -> Result<Option<DoipMessage>, CodecError> {
        // Register for the close notification before re-checking the flag,
        // otherwise a close racing this call could be missed.
        let closed = self.closed.notified();
        if !self.is_active() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = closed => Ok(None),
            frame = reader.next() => match frame {
                None => {
                    info!(
                        target: "doip::transport",
                        "peer closed connection {}", self.identifier
                    );
                    self.active.store(false, Ordering::SeqCst);
                    Ok(None)
                }
                Some(Ok(msg)) => {
                    trace!(
                        target: "doip::transport",
                        "received {} on {}", msg, self.identifier
                    );
                    Ok(Some(msg))
                }
                Some(Err(CodecError::Io(err))) => {
                    warn!(
                        target: "doip::transport",
                        "receive failed on {}: {err}", self.identifier
                    );
                    self.active.store(false, Ordering::SeqCst);
                    Ok(None)
                }
                Some(Err(err)) => {
                    // Framing violation: the caller may still answer with a
                    // header NACK before closing, so the socket stays open.
                    warn!(
                        target: "doip::transport",
                        "invalid frame on {}: {err}", self.identifier
                    );
                    Err(err)
                }
            },
        }
    }

    pub fn close(&self, reason: CloseReason) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(
                target: "doip::transport",
                "closing connection transport {} ({reason})", self.identifier
            );
            self.closed.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Listening/announcement endpoint of the server.
pub struct TcpServerTransport {
    loopback: AtomicBool,
    max_payload: usize,
    active: AtomicBool,
    port: AtomicU16,
    listener: RwLock<Option<TcpListener>>,
    udp: RwLock<Option<UdpSocket>>,
}

impl TcpServerTransport {
    pub fn new(loopback: bool, max_payload: usize) -> Self {
        TcpServerTransport {
            loopback: AtomicBool::new(loopback),
            max_payload,
            active: AtomicBool::new(false),
            port: AtomicU16::new(0),
            listener: RwLock::new(None),
            udp: RwLock::new(None),
        }
    }

    /// Switches between loopback announcements (127.0.0.1) and limited
    /// broadcast. Only meaningful before `setup`.
    pub fn set_loopback(&self, loopback: bool) {
        self.loopback.store(loopback, Ordering::SeqCst);
    }

    pub async fn setup(&self, tcp_port: u16) -> Result<(), TransportError> {
        info!(target: "doip::transport", "setting up server transport on port {tcp_port}");

        let listener = bind_tcp_listener(tcp_port)?;
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(tcp_port);
        // The discovery socket uses the same port number as the listener so
        // an ephemeral TCP port keeps the UDP side test-friendly too.
        let udp = match bind_udp_socket(if tcp_port == 0 { 0 } else { tcp_port }) {
            Ok(udp) => udp,
            Err(err) => {
                drop(listener);
                return Err(err);
            }
        };

        if !self.loopback.load(Ordering::SeqCst) {
            udp.set_broadcast(true)?;
            if let Err(err) =
                udp.join_multicast_v4(ANNOUNCEMENT_MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)
            {
                warn!(
                    target: "doip::transport",
                    "failed to join announcement multicast group: {err}"
                );
            }
        }

        *self.listener.write().await = Some(listener);
        *self.udp.write().await = Some(udp);
        self.port.store(bound_port, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        info!(
            target: "doip::transport",
            "server transport ready on port {bound_port} (loopback={})",
            self.loopback.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub async fn accept_connection(&self) -> Option<ConnectionTransport> {
        if !self.is_active() {
            return None;
        }
        let guard = self.listener.read().await;
        let listener = guard.as_ref()?;
        match timeout(ACCEPT_WAIT, listener.accept()).await {
            Err(_) => None, // nothing pending inside the wait window
            Ok(Ok((stream, peer))) => {
                info!(target: "doip::transport", "accepted connection from {peer}");
                Some(ConnectionTransport::Tcp(TcpConnectionTransport::new(
                    stream,
                    self.max_payload,
                )))
            }
            Ok(Err(err)) => {
                warn!(target: "doip::transport", "accept failed: {err}");
                None
            }
        }
    }

    pub async fn send_broadcast(
        &self,
        msg: &DoipMessage,
        port: u16,
    ) -> Result<usize, TransportError> {
        let guard = self.udp.read().await;
        let udp = guard.as_ref().ok_or(TransportError::NotReady)?;
        let dest: SocketAddr = if self.loopback.load(Ordering::SeqCst) {
            (Ipv4Addr::LOCALHOST, port).into()
        } else {
            (Ipv4Addr::BROADCAST, port).into()
        };
        let wire = encode_message(msg);
        let sent = udp.send_to(&wire, dest).await?;
        trace!(target: "doip::transport", "sent {sent} announcement bytes to {dest}");
        Ok(sent)
    }

    pub async fn receive_datagram(&self) -> Option<(Result<DoipMessage, CodecError>, SocketAddr)> {
        let guard = self.udp.read().await;
        let udp = guard.as_ref()?;
        let mut buf = [0u8; MAX_DATAGRAM];
        match udp.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                trace!(target: "doip::transport", "received {len} datagram bytes from {peer}");
                Some((parse_message_limited(&buf[..len], self.max_payload), peer))
            }
            Err(err) => {
                if self.is_active() {
                    warn!(target: "doip::transport", "datagram receive failed: {err}");
                }
                None
            }
        }
    }

    pub async fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        let guard = self.udp.read().await;
        let udp = guard.as_ref().ok_or(TransportError::NotReady)?;
        let wire = encode_message(msg);
        Ok(udp.send_to(&wire, dest).await?)
    }

    pub async fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(target: "doip::transport", "closing server transport");
            self.listener.write().await.take();
            self.udp.write().await.take();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn identifier(&self) -> String {
        format!("tcp-server:0.0.0.0:{}", self.port.load(Ordering::SeqCst))
    }

    pub async fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.listener
            .read()
            .await
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub async fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp.read().await.as_ref().and_then(|u| u.local_addr().ok())
    }
}

fn bind_tcp_listener(port: u16) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(TransportError::Io)?;
    socket
        .set_reuse_address(true)
        .map_err(TransportError::Io)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::from_bind_error(e, port))?;
    socket.listen(16).map_err(TransportError::Io)?;
    socket.set_nonblocking(true).map_err(TransportError::Io)?;
    TcpListener::from_std(socket.into()).map_err(TransportError::Io)
}

fn bind_udp_socket(port: u16) -> Result<UdpSocket, TransportError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Io)?;
    socket
        .set_reuse_address(true)
        .map_err(TransportError::Io)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::from_bind_error(e, port))?;
    socket.set_nonblocking(true).map_err(TransportError::Io)?;
    UdpSocket::from_std(socket.into()).map_err(TransportError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;
    use tokio::io::AsyncWriteExt;

    async fn connected_pair() -> (TcpConnectionTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (
            TcpConnectionTransport::new(server_side, message::DEFAULT_MAX_PAYLOAD),
            client,
        )
    }

    #[tokio::test]
    async fn message_roundtrip_over_tcp() {
        let (transport, mut client) = connected_pair().await;

        let request = message::routing_activation_request(0x0E00);
        client
            .write_all(&encode_message(&request))
            .await
            .unwrap();

        let received = transport.receive_message().await.unwrap().unwrap();
        assert_eq!(received, request);

        let response = message::routing_activation_response(
            0x0E00,
            0x0201,
            message::RoutingActivationResponseCode::RouteActivated,
        );
        let sent = transport.send_message(&response).await.unwrap();
        assert_eq!(sent, response.wire_len());
    }

    #[tokio::test]
    async fn peer_close_yields_none() {
        let (transport, client) = connected_pair().await;
        drop(client);
        assert!(transport.receive_message().await.unwrap().is_none());
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn local_close_unblocks_receiver() {
        let (transport, _client) = connected_pair().await;
        let transport = std::sync::Arc::new(transport);

        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive_message().await })
        };
        tokio::task::yield_now().await;
        transport.close(CloseReason::ApplicationRequest);
        let received = receiver.await.unwrap().unwrap();
        assert!(received.is_none());

        // Idempotent: a second close is a no-op.
        transport.close(CloseReason::ApplicationRequest);
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn bad_header_surfaces_framing_error() {
        let (transport, mut client) = connected_pair().await;
        client
            .write_all(&[0x01, 0xFE, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00])
            .await
            .unwrap();
        let err = transport.receive_message().await.unwrap_err();
        assert!(matches!(err, CodecError::InvalidProtocolVersion { .. }));
        // The socket is still usable for the header NACK reply.
        assert!(transport.is_active());
    }

    #[tokio::test]
    async fn server_transport_binds_and_accepts() {
        let server = TcpServerTransport::new(true, message::DEFAULT_MAX_PAYLOAD);
        server.setup(0).await.unwrap();
        let addr = server.local_tcp_addr().await.unwrap();

        assert!(server.accept_connection().await.is_none());

        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = server.accept_connection().await;
        assert!(accepted.is_some());

        server.close().await;
        assert!(!server.is_active());
        server.close().await;
    }

    #[tokio::test]
    async fn setup_reports_port_in_use() {
        let first = TcpServerTransport::new(true, message::DEFAULT_MAX_PAYLOAD);
        first.setup(0).await.unwrap();
        let port = first.local_tcp_addr().await.unwrap().port();

        let second = TcpServerTransport::new(true, message::DEFAULT_MAX_PAYLOAD);
        match second.setup(port).await {
            Err(TransportError::PortInUse(p)) => assert_eq!(p, port),
            other => panic!("expected PortInUse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn loopback_broadcast_reaches_local_listener() {
        let observer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let observer_port = observer.local_addr().unwrap().port();

        let server = TcpServerTransport::new(true, message::DEFAULT_MAX_PAYLOAD);
        server.setup(0).await.unwrap();

        let msg = message::alive_check_request();
        server.send_broadcast(&msg, observer_port).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = observer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], encode_message(&msg).as_slice());
    }
}
