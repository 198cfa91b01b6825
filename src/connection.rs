// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection DoIP state machine.
//!
//! Every accepted tester link owns one [`Connection`]. All inputs reach it
//! as [`ConnectionEvent`]s over a single channel: the reader task forwards
//! decoded frames (or framing violations), timer callbacks enqueue their
//! role, and downstream providers answer through a [`DownstreamResponder`].
//! The worker task drains that channel sequentially, so handlers always see
//! a consistent snapshot without a connection mutex.
//!
//! State flow: `SocketInitialized → WaitRoutingActivation → RoutingActivated
//! ⇄ WaitAliveCheckResponse`, `RoutingActivated → WaitDownstreamResponse →
//! RoutingActivated`, and any state can fall through `Finalize` into the
//! terminal `Closed`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};

use crate::codec::CodecError;
use crate::downstream::{DownstreamResponse, DownstreamStatus};
use crate::message::{self, DiagnosticAck, DiagnosticNackCode, DoipMessage, PayloadType};
use crate::model::{ConnectionContext, ServerModel};
use crate::timer::TimerHandle;
use crate::transport::ConnectionTransport;
use crate::{is_tester_address, CloseReason, LogicalAddress, ZERO_ADDRESS};

/// FSM states. Discriminants are contiguous and index
/// [`STATE_DESCRIPTORS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    SocketInitialized = 0,
    WaitRoutingActivation = 1,
    RoutingActivated = 2,
    WaitAliveCheckResponse = 3,
    WaitDownstreamResponse = 4,
    Finalize = 5,
    Closed = 6,
}

impl ConnectionState {
    fn index(self) -> usize {
        self as usize
    }
}

/// Roles a connection timer can play. All roles share the server-wide timer
/// manager; the key carries the connection id to keep connections apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerRole {
    InitialInactivity,
    GeneralInactivity,
    AliveCheck,
    DownstreamResponse,
    UserDefined,
}

const ALL_TIMER_ROLES: [TimerRole; 5] = [
    TimerRole::InitialInactivity,
    TimerRole::GeneralInactivity,
    TimerRole::AliveCheck,
    TimerRole::DownstreamResponse,
    TimerRole::UserDefined,
];

/// Key of one connection timer in the shared manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTimerId {
    pub connection: u64,
    pub role: TimerRole,
}

/// Static facts about one state: where a timeout falls back to, which timer
/// role guards the state, and an optional descriptor-local duration for the
/// `UserDefined` role.
#[derive(Debug, Clone, Copy)]
pub struct StateDescriptor {
    pub state: ConnectionState,
    pub timeout_fallback: ConnectionState,
    pub timer: Option<TimerRole>,
    pub user_timeout: Option<Duration>,
}

static STATE_DESCRIPTORS: [StateDescriptor; 7] = [
    StateDescriptor {
        state: ConnectionState::SocketInitialized,
        timeout_fallback: ConnectionState::WaitRoutingActivation,
        timer: None,
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::WaitRoutingActivation,
        timeout_fallback: ConnectionState::Finalize,
        timer: Some(TimerRole::InitialInactivity),
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::RoutingActivated,
        timeout_fallback: ConnectionState::Finalize,
        timer: Some(TimerRole::GeneralInactivity),
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::WaitAliveCheckResponse,
        timeout_fallback: ConnectionState::Finalize,
        timer: Some(TimerRole::AliveCheck),
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::WaitDownstreamResponse,
        timeout_fallback: ConnectionState::RoutingActivated,
        timer: Some(TimerRole::DownstreamResponse),
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::Finalize,
        timeout_fallback: ConnectionState::Closed,
        timer: None,
        user_timeout: None,
    },
    StateDescriptor {
        state: ConnectionState::Closed,
        timeout_fallback: ConnectionState::Closed,
        timer: None,
        user_timeout: None,
    },
];

/// Timer durations of one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimings {
    /// Window between accept and the first routing activation request.
    pub initial_inactivity: Duration,
    /// Idle window after activation before an alive check probes the tester.
    pub general_inactivity: Duration,
    /// Wait for one alive check response.
    pub alive_check: Duration,
    /// Wait for a downstream provider response.
    pub downstream_response: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        ConnectionTimings {
            initial_inactivity: Duration::from_secs(2),
            general_inactivity: Duration::from_secs(300),
            alive_check: Duration::from_millis(500),
            downstream_response: Duration::from_secs(2),
        }
    }
}

/// Everything that can reach the state machine.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete frame from the tester.
    Message(DoipMessage),
    /// The peer link is gone.
    PeerClosed,
    /// The reader hit a framing violation.
    ProtocolViolation(CodecError),
    /// A connection timer expired.
    TimerExpired(TimerRole),
    /// The downstream provider answered.
    Downstream(DownstreamResponse),
}

/// Exactly-once response path handed to the downstream model hook. Consuming
/// `respond` enqueues the result onto the connection's event channel, so
/// delivery is reentrancy-safe from any thread.
#[derive(Debug, Clone)]
pub struct DownstreamResponder {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl DownstreamResponder {
    pub fn new(tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        DownstreamResponder { tx }
    }

    pub fn respond(self, response: DownstreamResponse) {
        if self.tx.send(ConnectionEvent::Downstream(response)).is_err() {
            debug!(
                target: "doip::connection",
                "downstream response arrived after connection ended"
            );
        }
    }
}

/// The per-connection state machine.
pub struct Connection {
    id: u64,
    transport: Arc<ConnectionTransport>,
    model: Box<dyn ServerModel>,
    timers: TimerHandle<ConnectionTimerId>,
    timings: ConnectionTimings,
    alive_check_retry_limit: u8,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,

    state: ConnectionState,
    routed_client: LogicalAddress,
    alive_check_retry: u8,
    downstream_pending: bool,
    close_reason: Option<CloseReason>,
    closed: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        transport: Arc<ConnectionTransport>,
        model: Box<dyn ServerModel>,
        timers: TimerHandle<ConnectionTimerId>,
        timings: ConnectionTimings,
        alive_check_retry_limit: u8,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Connection {
            id,
            transport,
            model,
            timers,
            timings,
            alive_check_retry_limit,
            event_tx,
            state: ConnectionState::SocketInitialized,
            routed_client: ZERO_ADDRESS,
            alive_check_retry: 0,
            downstream_pending: false,
            close_reason: None,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Routed tester address; zero before routing activation.
    pub fn client_address(&self) -> LogicalAddress {
        self.routed_client
    }

    fn server_address(&self) -> LogicalAddress {
        self.model.server_address()
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            connection_id: self.id,
            transport_id: self.transport.identifier(),
            server_address: self.server_address(),
            client_address: self.routed_client,
        }
    }

    /// Fires `on_open` and enters the first waiting state. Must be called
    /// once before events are handled.
    pub async fn open(&mut self) {
        info!(
            target: "doip::connection",
            "[{}] connection {} opened (model {})",
            self.transport.identifier(),
            self.id,
            self.model.model_name()
        );
        let ctx = self.context();
        if catch_unwind(AssertUnwindSafe(|| self.model.on_open(&ctx))).is_err() {
            error!(target: "doip::connection", "[{}] on_open panicked", ctx.transport_id);
        }
        self.transition_to(ConnectionState::WaitRoutingActivation).await;
    }

    /// Drives the connection until it closes: `open`, then drain events,
    /// closing on server shutdown.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.open().await;
        while self.state != ConnectionState::Closed {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.close_connection(CloseReason::SocketError).await,
                },
                _ = shutdown.changed() => {
                    self.close_connection(CloseReason::ApplicationRequest).await;
                }
            }
        }
        debug!(
            target: "doip::connection",
            "[{}] worker exit ({})",
            self.transport.identifier(),
            self.close_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no reason".to_owned())
        );
    }

    /// Feeds one event through the state machine.
    pub async fn handle_event(&mut self, event: ConnectionEvent) {
        if self.closed {
            trace!(target: "doip::connection", "event after close ignored");
            return;
        }
        match event {
            ConnectionEvent::Message(msg) => self.handle_message(msg).await,
            ConnectionEvent::PeerClosed => {
                self.close_connection(CloseReason::SocketError).await;
            }
            ConnectionEvent::ProtocolViolation(err) => {
                warn!(
                    target: "doip::connection",
                    "[{}] protocol violation: {err}",
                    self.transport.identifier()
                );
                self.send(message::generic_header_nack(err.header_nack_code()))
                    .await;
                self.close_connection(CloseReason::InvalidMessage).await;
            }
            ConnectionEvent::TimerExpired(role) => self.handle_timeout(role).await,
            ConnectionEvent::Downstream(response) => {
                self.handle_downstream_response(response).await;
            }
        }
    }

    async fn handle_message(&mut self, msg: DoipMessage) {
        trace!(
            target: "doip::connection",
            "[{}] RX {} in {:?}",
            self.transport.identifier(),
            msg,
            self.state
        );
        match self.state {
            ConnectionState::SocketInitialized => {
                // open() was not driven yet; catch up, the frame is lost.
                self.transition_to(ConnectionState::WaitRoutingActivation).await;
            }
            ConnectionState::WaitRoutingActivation => {
                self.handle_wait_routing_activation(msg).await;
            }
            ConnectionState::RoutingActivated => self.handle_routing_activated(msg).await,
            ConnectionState::WaitAliveCheckResponse => {
                self.handle_wait_alive_check_response(msg).await;
            }
            ConnectionState::WaitDownstreamResponse => {
                self.handle_wait_downstream_response(msg).await;
            }
            ConnectionState::Finalize | ConnectionState::Closed => {}
        }
    }

    async fn handle_wait_routing_activation(&mut self, msg: DoipMessage) {
        let source = msg.source_address();
        // A well-formed request carries source, activation type and the
        // reserved block.
        if msg.payload_type() != PayloadType::RoutingActivationRequest
            || source.is_none()
            || msg.activation_type().is_none()
        {
            warn!(
                target: "doip::connection",
                "[{}] expected routing activation request, got {}",
                self.transport.identifier(),
                msg
            );
            self.send(message::generic_header_nack(
                message::HeaderNackCode::IncorrectPatternFormat,
            ))
            .await;
            self.close_connection(CloseReason::InvalidMessage).await;
            return;
        }
        let source = source.expect("checked above");

        if !is_tester_address(source) {
            warn!(
                target: "doip::connection",
                "[{}] routing activation from {source:#06x} outside the tester pool",
                self.transport.identifier()
            );
            self.send(message::routing_activation_response(
                source,
                self.server_address(),
                message::RoutingActivationResponseCode::UnknownSourceAddress,
            ))
            .await;
            self.close_connection(CloseReason::InvalidMessage).await;
            return;
        }

        self.routed_client = source;
        info!(
            target: "doip::connection",
            "[{}] routing activated for tester {source:#06x}",
            self.transport.identifier()
        );
        self.send(message::routing_activation_response(
            source,
            self.server_address(),
            message::RoutingActivationResponseCode::RouteActivated,
        ))
        .await;
        self.transition_to(ConnectionState::RoutingActivated).await;
    }

    async fn handle_routing_activated(&mut self, msg: DoipMessage) {
        match msg.payload_type() {
            PayloadType::DiagnosticMessage => {}
            PayloadType::AliveCheckResponse => {
                // Unsolicited but harmless; proof of life either way.
                self.restart_state_timer();
                return;
            }
            other => {
                warn!(
                    target: "doip::connection",
                    "[{}] unsupported payload {other:?} while routing activated",
                    self.transport.identifier()
                );
                self.send(message::diagnostic_negative_ack(
                    self.server_address(),
                    self.routed_client,
                    DiagnosticNackCode::TransportProtocolError,
                ))
                .await;
                return;
            }
        }

        let Some(source) = msg.source_address() else {
            self.close_connection(CloseReason::InvalidMessage).await;
            return;
        };
        if msg.target_address().is_none() {
            // Both addresses must precede the user data.
            self.close_connection(CloseReason::InvalidMessage).await;
            return;
        }
        if source != self.routed_client {
            warn!(
                target: "doip::connection",
                "[{}] diagnostic message from unexpected source {source:#06x}",
                self.transport.identifier()
            );
            self.send(message::diagnostic_negative_ack(
                self.server_address(),
                source,
                DiagnosticNackCode::InvalidSourceAddress,
            ))
            .await;
            return;
        }

        let ack = self.notify_diagnostic_message(&msg);
        self.send_diagnostic_ack(source, ack).await;
        self.restart_state_timer();

        if ack.is_some() {
            // Rejected by policy; nothing goes downstream.
            return;
        }

        if !self.model.has_downstream_handler() {
            trace!(
                target: "doip::connection",
                "[{}] no downstream handler, message consumed",
                self.transport.identifier()
            );
            return;
        }

        let status = self.notify_downstream_request(&msg);
        debug!(
            target: "doip::connection",
            "[{}] downstream request -> {status:?}",
            self.transport.identifier()
        );
        match status {
            DownstreamStatus::Handled => {
                // Any synchronously delivered response is already queued.
            }
            DownstreamStatus::Pending => {
                self.transition_to(ConnectionState::WaitDownstreamResponse).await;
            }
            DownstreamStatus::Error | DownstreamStatus::Timeout => {
                self.downstream_pending = false;
                self.send(message::diagnostic_negative_ack(
                    self.server_address(),
                    source,
                    DiagnosticNackCode::TargetUnreachable,
                ))
                .await;
            }
        }
    }

    async fn handle_wait_alive_check_response(&mut self, msg: DoipMessage) {
        match msg.payload_type() {
            // Any tester activity satisfies liveness.
            PayloadType::AliveCheckResponse | PayloadType::DiagnosticMessage => {
                self.transition_to(ConnectionState::RoutingActivated).await;
            }
            other => {
                warn!(
                    target: "doip::connection",
                    "[{}] unsupported payload {other:?} while waiting for alive check",
                    self.transport.identifier()
                );
                self.send(message::diagnostic_negative_ack(
                    self.server_address(),
                    self.routed_client,
                    DiagnosticNackCode::TransportProtocolError,
                ))
                .await;
            }
        }
    }

    async fn handle_wait_downstream_response(&mut self, msg: DoipMessage) {
        warn!(
            target: "doip::connection",
            "[{}] tester message {} while a downstream response is pending",
            self.transport.identifier(),
            msg
        );
        self.send(message::diagnostic_negative_ack(
            self.server_address(),
            self.routed_client,
            DiagnosticNackCode::TransportProtocolError,
        ))
        .await;
    }

    async fn handle_downstream_response(&mut self, response: DownstreamResponse) {
        if !self.downstream_pending {
            debug!(
                target: "doip::connection",
                "[{}] late downstream response dropped",
                self.transport.identifier()
            );
            return;
        }
        self.downstream_pending = false;

        debug!(
            target: "doip::connection",
            "[{}] downstream response {:?} after {:?}",
            self.transport.identifier(),
            response.status,
            response.latency
        );
        let reply = if response.status == DownstreamStatus::Handled {
            message::diagnostic_message(
                self.server_address(),
                self.routed_client,
                &response.payload,
            )
        } else {
            message::diagnostic_negative_ack(
                self.server_address(),
                self.routed_client,
                DiagnosticNackCode::TargetUnreachable,
            )
        };
        self.send(reply).await;
        self.transition_to(ConnectionState::RoutingActivated).await;
    }

    async fn handle_timeout(&mut self, role: TimerRole) {
        let descriptor = &STATE_DESCRIPTORS[self.state.index()];
        if descriptor.timer != Some(role) {
            debug!(
                target: "doip::connection",
                "[{}] stale {role:?} timeout in {:?} ignored",
                self.transport.identifier(),
                self.state
            );
            return;
        }
        warn!(
            target: "doip::connection",
            "[{}] timeout {role:?} in {:?}",
            self.transport.identifier(),
            self.state
        );

        match role {
            TimerRole::InitialInactivity => {
                self.close_connection(CloseReason::InitialInactivityTimeout).await;
            }
            TimerRole::GeneralInactivity => {
                self.send(message::alive_check_request()).await;
                self.transition_to(ConnectionState::WaitAliveCheckResponse).await;
            }
            TimerRole::AliveCheck => {
                if self.alive_check_retry < self.alive_check_retry_limit {
                    self.alive_check_retry += 1;
                    warn!(
                        target: "doip::connection",
                        "[{}] alive check retry {}/{}",
                        self.transport.identifier(),
                        self.alive_check_retry,
                        self.alive_check_retry_limit
                    );
                    self.send(message::alive_check_request()).await;
                    self.start_state_timer().await;
                } else {
                    self.close_connection(CloseReason::AliveCheckTimeout).await;
                }
            }
            TimerRole::DownstreamResponse => {
                self.downstream_pending = false;
                self.send(message::diagnostic_negative_ack(
                    self.server_address(),
                    self.routed_client,
                    DiagnosticNackCode::TargetUnreachable,
                ))
                .await;
                self.transition_to(ConnectionState::RoutingActivated).await;
            }
            TimerRole::UserDefined => {
                let fallback = descriptor.timeout_fallback;
                self.transition_to(fallback).await;
            }
        }
    }

    /// Switches states: cancels this connection's timers, arms the timer of
    /// the new state, runs on-entry effects. No-op when already there.
    async fn transition_to(&mut self, new_state: ConnectionState) {
        if self.closed || self.state == new_state {
            return;
        }
        debug!(
            target: "doip::connection",
            "[{}] state {:?} -> {new_state:?}",
            self.transport.identifier(),
            self.state
        );
        self.state = new_state;

        match new_state {
            ConnectionState::RoutingActivated => {
                self.alive_check_retry = 0;
            }
            ConnectionState::Finalize => {
                self.close_connection(CloseReason::ApplicationRequest).await;
                return;
            }
            ConnectionState::Closed => return,
            _ => {}
        }

        self.start_state_timer().await;
    }

    /// Arms the current state's timer from scratch; every other role of this
    /// connection is cancelled first.
    async fn start_state_timer(&mut self) {
        self.cancel_all_timers();
        let descriptor = &STATE_DESCRIPTORS[self.state.index()];
        let Some(role) = descriptor.timer else {
            return;
        };
        let duration = self.timer_duration(descriptor, role);
        if duration.is_zero() {
            debug!(
                target: "doip::connection",
                "[{}] zero {role:?} duration, immediate timeout",
                self.transport.identifier()
            );
            let _ = self.event_tx.send(ConnectionEvent::TimerExpired(role));
            return;
        }

        let callback = {
            let tx = self.event_tx.clone();
            Box::new(move || {
                let _ = tx.send(ConnectionEvent::TimerExpired(role));
            })
        };
        let key = ConnectionTimerId {
            connection: self.id,
            role,
        };
        match self.timers.add_timer(key, duration, callback, false) {
            Ok(_) => trace!(
                target: "doip::connection",
                "[{}] armed {role:?} for {duration:?}",
                self.transport.identifier()
            ),
            Err(err) => error!(
                target: "doip::connection",
                "[{}] failed to arm {role:?}: {err}",
                self.transport.identifier()
            ),
        }
    }

    /// Pushes the current state's timer out to a fresh full interval.
    fn restart_state_timer(&mut self) {
        let descriptor = &STATE_DESCRIPTORS[self.state.index()];
        let Some(role) = descriptor.timer else {
            return;
        };
        let key = ConnectionTimerId {
            connection: self.id,
            role,
        };
        if let Err(err) = self.timers.restart_timer(key) {
            error!(
                target: "doip::connection",
                "[{}] failed to restart {role:?}: {err}",
                self.transport.identifier()
            );
        }
    }

    fn cancel_all_timers(&self) {
        for role in ALL_TIMER_ROLES {
            let _ = self.timers.cancel_timer(ConnectionTimerId {
                connection: self.id,
                role,
            });
        }
    }

    fn timer_duration(&self, descriptor: &StateDescriptor, role: TimerRole) -> Duration {
        match role {
            TimerRole::InitialInactivity => self.timings.initial_inactivity,
            TimerRole::GeneralInactivity => self.timings.general_inactivity,
            TimerRole::AliveCheck => self.timings.alive_check,
            TimerRole::DownstreamResponse => self.timings.downstream_response,
            TimerRole::UserDefined => descriptor.user_timeout.unwrap_or(Duration::ZERO),
        }
    }

    /// Idempotent teardown: cancels timers, closes the transport, fires
    /// `on_close` exactly once, marks the state terminal.
    pub async fn close_connection(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(
            target: "doip::connection",
            "[{}] closing connection {} ({reason})",
            self.transport.identifier(),
            self.id
        );
        self.close_reason = Some(reason);
        self.cancel_all_timers();
        self.transport.close(reason);

        let ctx = self.context();
        if catch_unwind(AssertUnwindSafe(|| self.model.on_close(&ctx, reason))).is_err() {
            error!(
                target: "doip::connection",
                "[{}] on_close panicked", ctx.transport_id
            );
        }
        self.state = ConnectionState::Closed;
    }

    async fn send(&mut self, msg: DoipMessage) {
        trace!(
            target: "doip::connection",
            "[{}] TX {}",
            self.transport.identifier(),
            msg
        );
        if let Err(err) = self.transport.send_message(&msg).await {
            warn!(
                target: "doip::connection",
                "[{}] send failed: {err}",
                self.transport.identifier()
            );
            self.close_connection(CloseReason::SocketError).await;
        }
    }

    async fn send_diagnostic_ack(&mut self, tester: LogicalAddress, ack: DiagnosticAck) {
        self.send(message::diagnostic_ack(self.server_address(), tester, ack))
            .await;
        let ctx = self.context();
        if catch_unwind(AssertUnwindSafe(|| {
            self.model.on_diagnostic_ack_sent(&ctx, ack)
        }))
        .is_err()
        {
            error!(
                target: "doip::connection",
                "[{}] on_diagnostic_ack_sent panicked", ctx.transport_id
            );
        }
    }

    fn notify_diagnostic_message(&mut self, msg: &DoipMessage) -> DiagnosticAck {
        let ctx = self.context();
        match catch_unwind(AssertUnwindSafe(|| {
            self.model.on_diagnostic_message(&ctx, msg)
        })) {
            Ok(ack) => ack,
            Err(_) => {
                error!(
                    target: "doip::connection",
                    "[{}] on_diagnostic_message panicked", ctx.transport_id
                );
                Some(DiagnosticNackCode::TargetUnreachable)
            }
        }
    }

    fn notify_downstream_request(&mut self, msg: &DoipMessage) -> DownstreamStatus {
        let ctx = self.context();
        let responder = DownstreamResponder::new(self.event_tx.clone());
        self.downstream_pending = true;
        match catch_unwind(AssertUnwindSafe(|| {
            self.model.on_downstream_request(&ctx, msg, responder)
        })) {
            Ok(status) => status,
            Err(_) => {
                error!(
                    target: "doip::connection",
                    "[{}] on_downstream_request panicked", ctx.transport_id
                );
                DownstreamStatus::Error
            }
        }
    }
}
