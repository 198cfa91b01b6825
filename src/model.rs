// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application policy hooks.
//!
//! A [`ServerModel`] is created per accepted connection by the factory given
//! to the server core. All hooks run on the owning connection's worker task;
//! every hook has a default, so implementations override only what they care
//! about. A panic escaping a hook is caught at the state-machine boundary.

use std::sync::Arc;

use log::{debug, warn};

use crate::connection::DownstreamResponder;
use crate::downstream::{DownstreamProvider, DownstreamStatus};
use crate::message::{DiagnosticAck, DoipMessage, Eid, Gid, Vin};
use crate::{CloseReason, LogicalAddress};

/// Identity a DoIP entity announces: set before setup, immutable while the
/// server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerIdentity {
    pub vin: Vin,
    pub logical_address: LogicalAddress,
    pub eid: Eid,
    pub gid: Gid,
    pub further_action: u8,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        ServerIdentity {
            vin: Vin::ZERO,
            logical_address: 0x0201,
            eid: Eid::ZERO,
            gid: Gid::ZERO,
            further_action: 0x00,
        }
    }
}

/// Per-connection facts handed to every hook.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: u64,
    pub transport_id: String,
    pub server_address: LogicalAddress,
    /// Zero until routing activation succeeded.
    pub client_address: LogicalAddress,
}

/// Policy hooks of one connection.
pub trait ServerModel: Send + 'static {
    /// Logical address of the gateway this model answers for.
    fn server_address(&self) -> LogicalAddress;

    /// Name for logs.
    fn model_name(&self) -> &str {
        "default"
    }

    /// The connection reached its initial state.
    fn on_open(&mut self, _ctx: &ConnectionContext) {}

    /// The state machine reached `Closed`.
    fn on_close(&mut self, _ctx: &ConnectionContext, _reason: CloseReason) {}

    /// Called once per received diagnostic message, before any downstream
    /// dispatch. `None` acknowledges positively; a code rejects.
    fn on_diagnostic_message(
        &mut self,
        _ctx: &ConnectionContext,
        _msg: &DoipMessage,
    ) -> DiagnosticAck {
        None
    }

    /// Informational: the ack decided above went out on the wire.
    fn on_diagnostic_ack_sent(&mut self, _ctx: &ConnectionContext, _ack: DiagnosticAck) {}

    /// Whether diagnostic payloads are delegated downstream. When `false`,
    /// accepted diagnostic messages are positively acknowledged and
    /// consumed.
    fn has_downstream_handler(&self) -> bool {
        false
    }

    /// Dispatches an accepted diagnostic message downstream. On `Pending`,
    /// `respond` must later deliver the actual response.
    fn on_downstream_request(
        &mut self,
        _ctx: &ConnectionContext,
        _msg: &DoipMessage,
        _respond: DownstreamResponder,
    ) -> DownstreamStatus {
        DownstreamStatus::Error
    }
}

/// Produces a fresh model per accepted connection.
pub type ModelFactory = Arc<dyn Fn() -> Box<dyn ServerModel> + Send + Sync>;

/// Model without a downstream: every diagnostic message is positively
/// acknowledged and silently consumed.
pub struct DefaultServerModel {
    server_address: LogicalAddress,
}

impl DefaultServerModel {
    pub fn new(server_address: LogicalAddress) -> Self {
        DefaultServerModel { server_address }
    }
}

impl ServerModel for DefaultServerModel {
    fn server_address(&self) -> LogicalAddress {
        self.server_address
    }

    fn on_diagnostic_message(
        &mut self,
        ctx: &ConnectionContext,
        msg: &DoipMessage,
    ) -> DiagnosticAck {
        debug!(
            target: "doip::model",
            "[{}] consuming diagnostic message ({} user bytes)",
            ctx.transport_id,
            msg.user_data().map_or(0, |data| data.len())
        );
        None
    }
}

/// Model delegating diagnostic payloads to a [`DownstreamProvider`]. The
/// provider is started when the connection opens and stopped when it closes.
pub struct DownstreamServerModel {
    name: String,
    server_address: LogicalAddress,
    provider: Box<dyn DownstreamProvider>,
}

impl DownstreamServerModel {
    pub fn new(
        name: &str,
        server_address: LogicalAddress,
        provider: Box<dyn DownstreamProvider>,
    ) -> Self {
        DownstreamServerModel {
            name: name.to_owned(),
            server_address,
            provider,
        }
    }
}

impl ServerModel for DownstreamServerModel {
    fn server_address(&self) -> LogicalAddress {
        self.server_address
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn on_open(&mut self, ctx: &ConnectionContext) {
        if let Err(err) = self.provider.start() {
            warn!(
                target: "doip::model",
                "[{}] failed to start provider {}: {err:#}",
                ctx.transport_id,
                self.provider.provider_name()
            );
        }
    }

    fn on_close(&mut self, _ctx: &ConnectionContext, _reason: CloseReason) {
        self.provider.stop();
    }

    fn has_downstream_handler(&self) -> bool {
        true
    }

    fn on_downstream_request(
        &mut self,
        ctx: &ConnectionContext,
        msg: &DoipMessage,
        respond: DownstreamResponder,
    ) -> DownstreamStatus {
        let Some(user_data) = msg.user_data() else {
            return DownstreamStatus::Error;
        };
        debug!(
            target: "doip::model",
            "[{}] forwarding {} bytes to {}",
            ctx.transport_id,
            user_data.len(),
            self.provider.provider_name()
        );
        self.provider
            .send_request(user_data, Box::new(move |response| respond.respond(response)));
        DownstreamStatus::Pending
    }
}
