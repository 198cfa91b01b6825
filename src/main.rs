// SPDX-License-Identifier: Apache-2.0 OR MIT

//! doipd: stand-alone DoIP gateway daemon.
//!
//! Wires a [`DoipServer`] with the default model (positively acknowledges
//! and consumes every diagnostic message). Real deployments embed the
//! library and provide their own model/downstream pair; see
//! `demos/uds_gateway.rs`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use doip_gateway::config::GatewayConfig;
use doip_gateway::model::{DefaultServerModel, ServerModel};
use doip_gateway::transport::{ServerTransport, TcpServerTransport};
use doip_gateway::DoipServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON5 configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the TCP listening port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the announced VIN (17 ASCII characters).
    #[arg(long)]
    vin: Option<String>,

    /// Send announcements to 127.0.0.1 instead of the broadcast address.
    #[arg(long)]
    loopback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut file_config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = args.port {
        file_config.tcp_port = port;
    }
    if let Some(vin) = args.vin {
        file_config.vin = Some(vin);
    }
    if args.loopback {
        file_config.loopback = true;
    }
    let config = file_config
        .to_server_config()
        .context("validating configuration")?;

    let transport = ServerTransport::Tcp(TcpServerTransport::new(
        config.loopback,
        config.max_payload,
    ));
    let mut server = DoipServer::new(config, transport);

    let gateway_address = server.config().identity.logical_address;
    server
        .setup_tcp(Arc::new(move || {
            Box::new(DefaultServerModel::new(gateway_address)) as Box<dyn ServerModel>
        }))
        .await
        .context("binding DoIP sockets")?;
    server.setup_udp().context("starting UDP workers")?;

    info!(
        target: "doipd",
        "gateway {gateway_address:#06x} listening on port {}, ctrl-c to stop",
        server.config().tcp_port
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    server.stop().await;
    Ok(())
}
