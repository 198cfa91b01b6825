// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Downstream provider contract.
//!
//! A provider couples the DoIP connection to a lower protocol stack (UDS
//! over CAN ISO-TP in a real vehicle). The connection hands it the user data
//! of an accepted diagnostic message; the provider answers through the
//! callback exactly once, from whatever thread suits it. Response timeouts
//! are enforced by the connection state machine, not by the provider.

use std::time::Duration;

/// Outcome classification of a downstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamStatus {
    /// The request was handled; the response payload is final.
    Handled,
    /// The request was dispatched; the response arrives later via callback.
    Pending,
    /// The lower stack did not answer in time.
    Timeout,
    /// The request could not be delivered.
    Error,
}

/// Response delivered by a provider.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: DownstreamStatus,
    pub payload: Vec<u8>,
    pub latency: Duration,
}

impl DownstreamResponse {
    pub fn handled(payload: Vec<u8>, latency: Duration) -> Self {
        DownstreamResponse {
            status: DownstreamStatus::Handled,
            payload,
            latency,
        }
    }

    pub fn failed(status: DownstreamStatus) -> Self {
        DownstreamResponse {
            status,
            payload: Vec::new(),
            latency: Duration::ZERO,
        }
    }
}

/// Callback a provider invokes exactly once per request.
pub type DownstreamCallback = Box<dyn FnOnce(DownstreamResponse) + Send + 'static>;

/// Asynchronous request/response contract to the lower protocol stack.
pub trait DownstreamProvider: Send + 'static {
    /// Brings the provider up (opens sockets, spawns workers).
    fn start(&mut self) -> anyhow::Result<()>;

    /// Tears the provider down; pending callbacks may still fire.
    fn stop(&mut self);

    /// Dispatches one request. The provider must invoke `callback` exactly
    /// once; the callback may run on any thread.
    fn send_request(&mut self, payload: &[u8], callback: DownstreamCallback);

    /// Name for logs.
    fn provider_name(&self) -> &str {
        "downstream"
    }
}
