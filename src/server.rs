// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Server core.
//!
//! Owns the server transport and the shared timer manager, and runs three
//! background workers: the acceptor (TCP tester connections), the announcer
//! (vehicle identification broadcasts after startup) and the identification
//! responder (answers on the UDP discovery socket). Each accepted connection
//! gets two more tasks: a reader that frames bytes into events and the
//! connection worker driving the state machine.
//!
//! `stop()` is idempotent: it clears the running flag, signals the shutdown
//! watch, joins every worker (so all model callbacks finish) and only then
//! releases the sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionTimerId};
use crate::message::{self, Eid, Gid, PayloadType, Vin};
use crate::model::ModelFactory;
use crate::timer::TimerManager;
use crate::transport::{ConnectionTransport, ServerTransport, TransportError};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The DoIP server: acceptor, announcer, identification responder, and one
/// state machine per tester connection.
pub struct DoipServer {
    config: ServerConfig,
    transport: Arc<ServerTransport>,
    timers: TimerManager<ConnectionTimerId>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Vec<JoinHandle<()>>,
    connection_workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl DoipServer {
    pub fn new(config: ServerConfig, transport: ServerTransport) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let ServerTransport::Tcp(tcp) = &transport {
            tcp.set_loopback(config.loopback);
        }
        DoipServer {
            config,
            transport: Arc::new(transport),
            timers: TimerManager::new(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            workers: Vec::new(),
            connection_workers: Arc::new(Mutex::new(Vec::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Access to the owned transport (tests observe broadcasts and inject
    /// connections through it).
    pub fn transport(&self) -> &Arc<ServerTransport> {
        &self.transport
    }

    fn identity_guard(&self, what: &str) -> bool {
        if self.is_running() {
            warn!(
                target: "doip::server",
                "ignoring {what} while the server is running"
            );
            return false;
        }
        true
    }

    pub fn set_vin(&mut self, vin: Vin) {
        if self.identity_guard("set_vin") {
            self.config.identity.vin = vin;
        }
    }

    pub fn set_eid(&mut self, eid: Eid) {
        if self.identity_guard("set_eid") {
            self.config.identity.eid = eid;
        }
    }

    pub fn set_gid(&mut self, gid: Gid) {
        if self.identity_guard("set_gid") {
            self.config.identity.gid = gid;
        }
    }

    pub fn set_logical_gateway_address(&mut self, address: crate::LogicalAddress) {
        if self.identity_guard("set_logical_gateway_address") {
            self.config.identity.logical_address = address;
        }
    }

    pub fn set_further_action(&mut self, further_action: u8) {
        if self.identity_guard("set_further_action") {
            self.config.identity.further_action = further_action;
        }
    }

    pub fn set_announce_count(&mut self, count: u32) {
        if self.identity_guard("set_announce_count") {
            self.config.announce_count = count;
        }
    }

    pub fn set_announce_interval(&mut self, interval: Duration) {
        if self.identity_guard("set_announce_interval") {
            self.config.announce_interval = interval;
        }
    }

    pub fn set_loopback_mode(&mut self, loopback: bool) {
        if self.identity_guard("set_loopback_mode") {
            self.config.loopback = loopback;
            if let ServerTransport::Tcp(tcp) = self.transport.as_ref() {
                tcp.set_loopback(loopback);
            }
            info!(
                target: "doip::server",
                "vehicle announcements will use {}",
                if loopback { "loopback (127.0.0.1)" } else { "broadcast (255.255.255.255)" }
            );
        }
    }

    /// Binds the transport and starts the acceptor. The factory produces one
    /// fresh model per accepted connection. On a setup failure no workers
    /// are spawned and the server stays non-running.
    pub async fn setup_tcp(&mut self, factory: ModelFactory) -> Result<(), TransportError> {
        debug!(
            target: "doip::server",
            "setting up TCP transport on port {}", self.config.tcp_port
        );
        self.transport.setup(self.config.tcp_port).await?;
        self.running.store(true, Ordering::SeqCst);

        let worker = tokio::spawn(acceptor_loop(AcceptorContext {
            transport: self.transport.clone(),
            factory,
            timers: self.timers.handle(),
            config: self.config.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown_rx.clone(),
            connection_workers: self.connection_workers.clone(),
            next_connection_id: self.next_connection_id.clone(),
        }));
        self.workers.push(worker);
        info!(
            target: "doip::server",
            "TCP transport ready, listening on port {}", self.config.tcp_port
        );
        Ok(())
    }

    /// Starts the announcement worker and the UDP identification responder.
    /// Requires `setup_tcp` to have bound the sockets.
    pub fn setup_udp(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_active() {
            return Err(TransportError::NotReady);
        }

        let announcer = tokio::spawn(announcement_loop(
            self.transport.clone(),
            self.config.clone(),
            self.running.clone(),
            self.shutdown_rx.clone(),
        ));
        self.workers.push(announcer);

        let responder = tokio::spawn(identification_responder_loop(
            self.transport.clone(),
            self.config.clone(),
            self.running.clone(),
            self.shutdown_rx.clone(),
        ));
        self.workers.push(responder);
        Ok(())
    }

    /// Stops everything: workers are joined (all callbacks finish) before
    /// the sockets are released. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && self.workers.is_empty() {
            return;
        }
        info!(target: "doip::server", "stopping DoIP server");
        let _ = self.shutdown_tx.send(true);

        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                error!(target: "doip::server", "worker task failed: {err}");
            }
        }
        let mut connections = self.connection_workers.lock().await;
        for worker in connections.drain(..) {
            if let Err(err) = worker.await {
                error!(target: "doip::server", "connection task failed: {err}");
            }
        }
        drop(connections);

        info!(target: "doip::server", "workers joined, closing transport");
        self.transport.close().await;
        self.timers.shutdown().await;
    }
}

struct AcceptorContext {
    transport: Arc<ServerTransport>,
    factory: ModelFactory,
    timers: crate::timer::TimerHandle<ConnectionTimerId>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    connection_workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_connection_id: Arc<AtomicU64>,
}

async fn acceptor_loop(mut ctx: AcceptorContext) {
    info!(target: "doip::server", "acceptor started");
    while ctx.running.load(Ordering::SeqCst) {
        let accepted = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            accepted = ctx.transport.accept_connection() => accepted,
        };
        let Some(conn_transport) = accepted else {
            // Nothing pending; back off briefly, leaving promptly on stop.
            tokio::select! {
                _ = ctx.shutdown.changed() => break,
                _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
            }
            continue;
        };

        let id = ctx.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let model = (ctx.factory)();
        info!(
            target: "doip::server",
            "accepted connection {} from {} (model {})",
            id,
            conn_transport.identifier(),
            model.model_name()
        );

        let transport = Arc::new(conn_transport);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            id,
            transport.clone(),
            model,
            ctx.timers.clone(),
            ctx.config.timings,
            ctx.config.alive_check_retries,
            event_tx.clone(),
        );

        let reader = tokio::spawn(reader_loop(transport, event_tx));
        let worker = tokio::spawn(connection.run(event_rx, ctx.shutdown.clone()));

        let mut workers = ctx.connection_workers.lock().await;
        workers.push(reader);
        workers.push(worker);
    }
    info!(target: "doip::server", "acceptor stopped");
}

/// Forwards decoded frames into the connection's event channel until the
/// link dies or a framing violation ends the stream.
async fn reader_loop(
    transport: Arc<ConnectionTransport>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    loop {
        match transport.receive_message().await {
            Ok(Some(msg)) => {
                if events.send(ConnectionEvent::Message(msg)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(ConnectionEvent::PeerClosed);
                break;
            }
            Err(err) => {
                let _ = events.send(ConnectionEvent::ProtocolViolation(err));
                break;
            }
        }
    }
}

async fn announcement_loop(
    transport: Arc<ServerTransport>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        target: "doip::server",
        "announcement worker started ({} announcements every {:?})",
        config.announce_count,
        config.announce_interval
    );
    let identity = &config.identity;
    let msg = message::vehicle_identification_response(
        &identity.vin,
        identity.logical_address,
        &identity.eid,
        &identity.gid,
        identity.further_action,
        None,
    );

    for n in 0..config.announce_count {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match transport
            .send_broadcast(&msg, config.announce_port)
            .await
        {
            Ok(sent) => info!(
                target: "doip::server",
                "sent vehicle announcement {}/{} ({sent} bytes)",
                n + 1,
                config.announce_count
            ),
            Err(err) => error!(
                target: "doip::server",
                "failed to send vehicle announcement: {err}"
            ),
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(config.announce_interval) => {}
        }
    }
    info!(target: "doip::server", "announcement worker finished");
}

/// Answers vehicle identification requests on the UDP discovery socket.
/// Undecodable datagrams get a generic header NACK; all errors are logged
/// and the loop continues.
async fn identification_responder_loop(
    transport: Arc<ServerTransport>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(target: "doip::server", "identification responder started");
    while running.load(Ordering::SeqCst) {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.receive_datagram() => received,
        };
        let Some((parsed, peer)) = received else {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
            }
            continue;
        };

        let identity = &config.identity;
        let reply = match parsed {
            Err(err) => {
                warn!(
                    target: "doip::server",
                    "undecodable datagram from {peer}: {err}"
                );
                Some(message::generic_header_nack(err.header_nack_code()))
            }
            Ok(msg) => match msg.payload_type() {
                PayloadType::VehicleIdentificationRequest => Some(identification_response(&config)),
                PayloadType::VehicleIdentificationRequestEid => {
                    if msg.eid() == Some(identity.eid) {
                        Some(identification_response(&config))
                    } else {
                        None
                    }
                }
                PayloadType::VehicleIdentificationRequestVin => {
                    if msg.vin() == Some(identity.vin) {
                        Some(identification_response(&config))
                    } else {
                        None
                    }
                }
                other => {
                    debug!(
                        target: "doip::server",
                        "unexpected {other:?} datagram from {peer}"
                    );
                    Some(message::generic_header_nack(
                        message::HeaderNackCode::IncorrectPatternFormat,
                    ))
                }
            },
        };

        if let Some(reply) = reply {
            if let Err(err) = transport.send_datagram(&reply, peer).await {
                error!(
                    target: "doip::server",
                    "failed to answer {peer}: {err}"
                );
            }
        }
    }
    info!(target: "doip::server", "identification responder stopped");
}

fn identification_response(config: &ServerConfig) -> message::DoipMessage {
    let identity = &config.identity;
    message::vehicle_identification_response(
        &identity.vin,
        identity.logical_address,
        &identity.eid,
        &identity.gid,
        identity.further_action,
        None,
    )
}
