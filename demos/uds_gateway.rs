// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DoIP gateway answering a small UDS service table.
//!
//! Run with `cargo run --example uds_gateway`, then point any DoIP tester at
//! 127.0.0.1:13400 (or discover it via a vehicle identification request).
//! The downstream provider is table-driven: requests are matched as hex
//! strings against regular expressions, unknown services get the UDS
//! service-not-supported negative response.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::info;
use regex::Regex;

use doip_gateway::config::GatewayConfig;
use doip_gateway::downstream::{DownstreamCallback, DownstreamProvider, DownstreamResponse};
use doip_gateway::model::{DownstreamServerModel, ServerModel};
use doip_gateway::transport::{ServerTransport, TcpServerTransport};
use doip_gateway::{DoipServer, Vin};

const UDS_ANSWERS: [(&str, &str); 3] = [
    // ReadDataByIdentifier F190 (VIN)
    ("22f190", "62f19057564757414b45323034313233343536"),
    // ReadDataByIdentifier F187 (spare part number)
    ("22f187", "62f18744454d4f2d303031"),
    // TesterPresent
    ("3e00", "7e00"),
];

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn hex_bytes(s: &str) -> Vec<u8> {
    s.as_bytes()
        .chunks(2)
        .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap())
        .collect()
}

/// Table-driven UDS responder standing in for a real CAN ISO-TP stack.
struct UdsTableProvider {
    answers: Vec<(Regex, Vec<u8>)>,
}

impl UdsTableProvider {
    fn new() -> Self {
        let answers = UDS_ANSWERS
            .iter()
            .map(|(pattern, answer)| (Regex::new(pattern).unwrap(), hex_bytes(answer)))
            .collect();
        UdsTableProvider { answers }
    }
}

impl DownstreamProvider for UdsTableProvider {
    fn start(&mut self) -> anyhow::Result<()> {
        info!(target: "uds_gateway", "UDS table provider started");
        Ok(())
    }

    fn stop(&mut self) {}

    fn send_request(&mut self, payload: &[u8], callback: DownstreamCallback) {
        let request = hex_string(payload);
        info!(target: "uds_gateway", "UDS request: {request}");
        let answer = self
            .answers
            .iter()
            .find(|(pattern, _)| pattern.is_match(&request))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| vec![0x7F, payload.first().copied().unwrap_or(0), 0x11]);
        info!(target: "uds_gateway", "UDS answer:  {}", hex_string(&answer));
        callback(DownstreamResponse::handled(answer, Duration::ZERO));
    }

    fn provider_name(&self) -> &str {
        "uds-table"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut file_config = GatewayConfig::default();
    file_config.loopback = true;
    file_config.vin = Some("DEMO0GATEWAY00001".to_owned());
    let config = file_config.to_server_config().context("configuration")?;

    let transport = ServerTransport::Tcp(TcpServerTransport::new(
        config.loopback,
        config.max_payload,
    ));
    let mut server = DoipServer::new(config, transport);
    server.set_vin(Vin::new("DEMO0GATEWAY00001").expect("valid VIN"));

    let gateway_address = server.config().identity.logical_address;
    server
        .setup_tcp(Arc::new(move || {
            Box::new(DownstreamServerModel::new(
                "uds-demo",
                gateway_address,
                Box::new(UdsTableProvider::new()),
            )) as Box<dyn ServerModel>
        }))
        .await
        .context("binding DoIP sockets")?;
    server.setup_udp().context("starting UDP workers")?;

    info!(
        target: "uds_gateway",
        "demo gateway {gateway_address:#06x} up on 127.0.0.1:{}, ctrl-c to stop",
        server.config().tcp_port
    );
    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
