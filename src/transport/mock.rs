// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-memory transports for tests.
//!
//! The connection double keeps two FIFOs: whatever the state machine sends
//! lands in the outgoing queue for assertions, and tests feed the incoming
//! queue with `inject_message`/`inject_violation`. Receive can be blocking
//! (waits for an injection or close, like a real socket) or non-blocking.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::debug;
use tokio::sync::Notify;

use crate::codec::CodecError;
use crate::message::DoipMessage;
use crate::transport::{ConnectionTransport, TransportError};
use crate::CloseReason;

/// Bound of either direction's queue.
const QUEUE_CAPACITY: usize = 1024;

fn queue_full_error() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::WouldBlock,
        "in-memory queue full",
    ))
}

/// Test double for one tester link.
pub struct InMemoryConnectionTransport {
    identifier: String,
    blocking: bool,
    active: AtomicBool,
    closed: Notify,
    incoming: Mutex<VecDeque<Result<DoipMessage, CodecError>>>,
    incoming_ready: Notify,
    sent: Mutex<VecDeque<DoipMessage>>,
}

impl InMemoryConnectionTransport {
    pub fn new(identifier: &str, blocking: bool) -> Self {
        InMemoryConnectionTransport {
            identifier: identifier.to_owned(),
            blocking,
            active: AtomicBool::new(true),
            closed: Notify::new(),
            incoming: Mutex::new(VecDeque::new()),
            incoming_ready: Notify::new(),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn send_message(&self, msg: &DoipMessage) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive);
        }
        let mut sent = self.sent.lock().unwrap();
        if sent.len() >= QUEUE_CAPACITY {
            return Err(queue_full_error());
        }
        sent.push_back(msg.clone());
        Ok(msg.wire_len())
    }

    pub async fn receive_message(&self) -> Result<Option<DoipMessage>, CodecError> {
        loop {
            let ready = self.incoming_ready.notified();
            let closed = self.closed.notified();
            if !self.is_active() {
                return Ok(None);
            }
            if let Some(next) = self.incoming.lock().unwrap().pop_front() {
                return next.map(Some);
            }
            if !self.blocking {
                return Ok(None);
            }
            tokio::select! {
                _ = ready => {}
                _ = closed => return Ok(None),
            }
        }
    }

    /// Wakes blocked receivers and drains the incoming queue. The sent log
    /// survives so tests can assert on replies written just before the
    /// close.
    pub fn close(&self, reason: CloseReason) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(
                target: "doip::transport",
                "closing in-memory transport {} ({reason})", self.identifier
            );
            self.incoming.lock().unwrap().clear();
            self.closed.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queues a message as if the peer had sent it. Overflow beyond the
    /// queue bound is dropped.
    pub fn inject_message(&self, msg: DoipMessage) {
        let mut incoming = self.incoming.lock().unwrap();
        if incoming.len() >= QUEUE_CAPACITY {
            debug!(
                target: "doip::transport",
                "{}: incoming queue full, injection dropped", self.identifier
            );
            return;
        }
        incoming.push_back(Ok(msg));
        drop(incoming);
        self.incoming_ready.notify_one();
    }

    /// Queues a framing violation as if the peer had sent garbage.
    pub fn inject_violation(&self, err: CodecError) {
        self.incoming.lock().unwrap().push_back(Err(err));
        self.incoming_ready.notify_one();
    }

    /// Pops the oldest message the state machine sent.
    pub fn pop_sent_message(&self) -> Option<DoipMessage> {
        self.sent.lock().unwrap().pop_front()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Drains both queues.
    pub fn clear(&self) {
        self.incoming.lock().unwrap().clear();
        self.sent.lock().unwrap().clear();
    }
}

/// Test double for the server-side transport.
pub struct InMemoryServerTransport {
    active: AtomicBool,
    fail_setup: bool,
    pending: Mutex<VecDeque<ConnectionTransport>>,
    broadcasts: Mutex<Vec<(DoipMessage, u16)>>,
    datagrams_in: Mutex<VecDeque<(Result<DoipMessage, CodecError>, SocketAddr)>>,
    datagrams_ready: Notify,
    closed: Notify,
    datagrams_out: Mutex<Vec<(DoipMessage, SocketAddr)>>,
}

impl InMemoryServerTransport {
    pub fn new() -> Self {
        InMemoryServerTransport {
            active: AtomicBool::new(false),
            fail_setup: false,
            pending: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            datagrams_in: Mutex::new(VecDeque::new()),
            datagrams_ready: Notify::new(),
            closed: Notify::new(),
            datagrams_out: Mutex::new(Vec::new()),
        }
    }

    /// A transport whose `setup` fails, for exercising the fatal setup path.
    pub fn failing_setup() -> Self {
        InMemoryServerTransport {
            fail_setup: true,
            ..InMemoryServerTransport::new()
        }
    }

    pub fn setup(&self, tcp_port: u16) -> Result<(), TransportError> {
        if self.fail_setup {
            return Err(TransportError::PortInUse(tcp_port));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn accept_connection(&self) -> Option<ConnectionTransport> {
        if !self.is_active() {
            return None;
        }
        self.pending.lock().unwrap().pop_front()
    }

    pub fn send_broadcast(&self, msg: &DoipMessage, port: u16) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive);
        }
        let len = msg.wire_len();
        self.broadcasts.lock().unwrap().push((msg.clone(), port));
        Ok(len)
    }

    pub async fn receive_datagram(&self) -> Option<(Result<DoipMessage, CodecError>, SocketAddr)> {
        loop {
            let ready = self.datagrams_ready.notified();
            let closed = self.closed.notified();
            if !self.is_active() {
                return None;
            }
            if let Some(next) = self.datagrams_in.lock().unwrap().pop_front() {
                return Some(next);
            }
            tokio::select! {
                _ = ready => {}
                _ = closed => return None,
            }
        }
    }

    pub fn send_datagram(
        &self,
        msg: &DoipMessage,
        dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive);
        }
        let len = msg.wire_len();
        self.datagrams_out.lock().unwrap().push((msg.clone(), dest));
        Ok(len)
    }

    pub fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.pending.lock().unwrap().clear();
            self.closed.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn identifier(&self) -> String {
        "in-memory-server".to_owned()
    }

    /// Queues a connection for the acceptor to pick up.
    pub fn push_connection(&self, conn: ConnectionTransport) {
        self.pending.lock().unwrap().push_back(conn);
    }

    /// Queues an incoming datagram for the identification responder.
    pub fn inject_datagram(&self, msg: Result<DoipMessage, CodecError>, from: SocketAddr) {
        self.datagrams_in.lock().unwrap().push_back((msg, from));
        self.datagrams_ready.notify_one();
    }

    /// All announcements recorded so far, with their destination port.
    pub fn broadcast_log(&self) -> Vec<(DoipMessage, u16)> {
        self.broadcasts.lock().unwrap().clone()
    }

    /// All unicast datagram replies recorded so far.
    pub fn datagram_log(&self) -> Vec<(DoipMessage, SocketAddr)> {
        self.datagrams_out.lock().unwrap().clone()
    }
}

impl Default for InMemoryServerTransport {
    fn default() -> Self {
        InMemoryServerTransport::new()
    }
}
