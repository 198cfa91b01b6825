// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end tests against a real server instance on ephemeral ports:
//! a TCP tester runs routing activation and a diagnostic exchange, UDP
//! observers see announcements and identification responses.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use doip_gateway::codec::{encode_message, parse_message};
use doip_gateway::config::{GatewayConfig, ServerConfig};
use doip_gateway::message::{self, PayloadType};
use doip_gateway::model::{DefaultServerModel, DownstreamServerModel, ServerModel};
use doip_gateway::downstream::{DownstreamCallback, DownstreamProvider, DownstreamResponse};
use doip_gateway::transport::{ServerTransport, TcpServerTransport};
use doip_gateway::{DoipServer, Vin};

const GATEWAY: u16 = 0x0201;
const TESTER: u16 = 0x0E00;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(announce_port: u16) -> ServerConfig {
    let mut cfg = GatewayConfig::default();
    cfg.vin = Some("TESTVIN0123456789".to_owned());
    cfg.tcp_port = 0; // ephemeral
    cfg.loopback = true;
    cfg.announce_count = 2;
    cfg.announce_interval_ms = 50;
    cfg.announce_port = Some(announce_port);
    cfg.to_server_config().expect("valid test config")
}

async fn start_server(factory: doip_gateway::model::ModelFactory) -> (DoipServer, std::net::SocketAddr, UdpSocket) {
    let observer = UdpSocket::bind("127.0.0.1:0").await.expect("observer bind");
    let announce_port = observer.local_addr().unwrap().port();

    let config = test_config(announce_port);
    let transport = ServerTransport::Tcp(TcpServerTransport::new(true, config.max_payload));
    let mut server = DoipServer::new(config, transport);
    server.setup_tcp(factory).await.expect("setup_tcp");
    server.setup_udp().expect("setup_udp");

    let addr = server
        .transport()
        .local_tcp_addr()
        .await
        .expect("bound listener");
    (server, addr, observer)
}

fn default_factory() -> doip_gateway::model::ModelFactory {
    Arc::new(|| Box::new(DefaultServerModel::new(GATEWAY)) as Box<dyn ServerModel>)
}

async fn read_frame(stream: &mut TcpStream) -> message::DoipMessage {
    let mut header = [0u8; 8];
    timeout(IO_TIMEOUT, stream.read_exact(&mut header))
        .await
        .expect("header within timeout")
        .expect("header read");
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(8 + len, 0);
    timeout(IO_TIMEOUT, stream.read_exact(&mut frame[8..]))
        .await
        .expect("payload within timeout")
        .expect("payload read");
    parse_message(&frame).expect("valid frame from server")
}

async fn activate(stream: &mut TcpStream) {
    stream
        .write_all(&encode_message(&message::routing_activation_request(TESTER)))
        .await
        .expect("send activation");
    let response = read_frame(stream).await;
    assert_eq!(
        response.payload_type(),
        PayloadType::RoutingActivationResponse
    );
    assert_eq!(response.routing_activation_result(), Some(0x10));
    assert_eq!(response.payload()[..2], TESTER.to_be_bytes());
    assert_eq!(response.payload()[2..4], GATEWAY.to_be_bytes());
}

#[tokio::test]
async fn tcp_activation_and_diagnostic_exchange() {
    let (mut server, addr, _observer) = start_server(default_factory()).await;

    let mut tester = TcpStream::connect(addr).await.expect("connect");
    activate(&mut tester).await;

    // Tester present, positively acknowledged and consumed by the default
    // model.
    tester
        .write_all(&encode_message(&message::diagnostic_message(
            TESTER,
            GATEWAY,
            &[0x3E, 0x00],
        )))
        .await
        .expect("send diagnostic");
    let ack = read_frame(&mut tester).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticMessagePositiveAck);
    assert_eq!(ack.source_address(), Some(GATEWAY));
    assert_eq!(ack.target_address(), Some(TESTER));

    server.stop().await;
    assert!(!server.is_running());
    // Idempotent.
    server.stop().await;
}

#[tokio::test]
async fn downstream_model_round_trips_over_tcp() {
    struct EchoProvider;
    impl DownstreamProvider for EchoProvider {
        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn send_request(&mut self, payload: &[u8], callback: DownstreamCallback) {
            let mut answer = payload.to_vec();
            answer[0] |= 0x40; // UDS positive-response service id
            callback(DownstreamResponse::handled(answer, Duration::ZERO));
        }
    }

    let factory: doip_gateway::model::ModelFactory = Arc::new(|| {
        Box::new(DownstreamServerModel::new(
            "echo",
            GATEWAY,
            Box::new(EchoProvider),
        )) as Box<dyn ServerModel>
    });
    let (mut server, addr, _observer) = start_server(factory).await;

    let mut tester = TcpStream::connect(addr).await.expect("connect");
    activate(&mut tester).await;

    tester
        .write_all(&encode_message(&message::diagnostic_message(
            TESTER,
            GATEWAY,
            &[0x22, 0xF1, 0x90],
        )))
        .await
        .expect("send diagnostic");

    let ack = read_frame(&mut tester).await;
    assert_eq!(ack.payload_type(), PayloadType::DiagnosticMessagePositiveAck);
    let reply = read_frame(&mut tester).await;
    assert_eq!(reply.payload_type(), PayloadType::DiagnosticMessage);
    assert_eq!(reply.user_data(), Some(&[0x62, 0xF1, 0x90][..]));

    server.stop().await;
}

#[tokio::test]
async fn announcements_reach_the_test_equipment_port() {
    let (mut server, _addr, observer) = start_server(default_factory()).await;

    let mut buf = [0u8; 256];
    let (len, _) = timeout(IO_TIMEOUT, observer.recv_from(&mut buf))
        .await
        .expect("announcement within timeout")
        .expect("receive");
    let announcement = parse_message(&buf[..len]).expect("valid announcement");
    assert_eq!(
        announcement.payload_type(),
        PayloadType::VehicleIdentificationResponse
    );
    assert_eq!(announcement.logical_address(), Some(GATEWAY));
    assert_eq!(
        announcement.vin(),
        Some(Vin::new("TESTVIN0123456789").unwrap())
    );

    // The configured count is two.
    let (len, _) = timeout(IO_TIMEOUT, observer.recv_from(&mut buf))
        .await
        .expect("second announcement")
        .expect("receive");
    assert!(parse_message(&buf[..len]).is_ok());

    server.stop().await;
}

#[tokio::test]
async fn udp_identification_request_is_answered() {
    let (mut server, _addr, _observer) = start_server(default_factory()).await;
    let udp_port = server
        .transport()
        .local_udp_addr()
        .await
        .expect("bound udp socket")
        .port();
    let udp_addr: std::net::SocketAddr = ([127, 0, 0, 1], udp_port).into();

    let requester = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    requester
        .send_to(
            &encode_message(&message::vehicle_identification_request()),
            udp_addr,
        )
        .await
        .expect("send request");

    let mut buf = [0u8; 256];
    let (len, _) = timeout(IO_TIMEOUT, requester.recv_from(&mut buf))
        .await
        .expect("response within timeout")
        .expect("receive");
    let response = parse_message(&buf[..len]).expect("valid response");
    assert_eq!(
        response.payload_type(),
        PayloadType::VehicleIdentificationResponse
    );
    assert_eq!(response.logical_address(), Some(GATEWAY));

    // A VIN-qualified request for someone else's VIN stays unanswered; a
    // garbage datagram draws a header NACK.
    requester
        .send_to(
            &encode_message(&message::vehicle_identification_request_vin(
                &Vin::new("OTHERVIN000000000").unwrap(),
            )),
            udp_addr,
        )
        .await
        .expect("send mismatching request");
    requester
        .send_to(&[0xDE, 0xAD, 0xBE, 0xEF], udp_addr)
        .await
        .expect("send garbage");

    let (len, _) = timeout(IO_TIMEOUT, requester.recv_from(&mut buf))
        .await
        .expect("NACK within timeout")
        .expect("receive");
    let nack = parse_message(&buf[..len]).expect("valid NACK");
    assert_eq!(nack.payload_type(), PayloadType::GenericHeaderNegativeAck);

    server.stop().await;
}

#[tokio::test]
async fn invalid_header_draws_nack_and_close() {
    let (mut server, addr, _observer) = start_server(default_factory()).await;

    let mut tester = TcpStream::connect(addr).await.expect("connect");
    tester
        .write_all(&[0x01, 0xFE, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00])
        .await
        .expect("send bad header");

    let nack = read_frame(&mut tester).await;
    assert_eq!(nack.payload_type(), PayloadType::GenericHeaderNegativeAck);

    // The server hangs up after the NACK.
    let mut rest = Vec::new();
    let read = timeout(IO_TIMEOUT, tester.read_to_end(&mut rest))
        .await
        .expect("close within timeout")
        .expect("read");
    assert_eq!(read, 0);

    server.stop().await;
}

#[tokio::test]
async fn setup_failure_leaves_server_non_running() {
    let holder = TcpServerTransport::new(true, doip_gateway::message::DEFAULT_MAX_PAYLOAD);
    holder.setup(0).await.expect("bind holder");
    let taken_port = holder.local_tcp_addr().await.unwrap().port();

    let mut cfg = GatewayConfig::default();
    cfg.tcp_port = taken_port;
    cfg.loopback = true;
    let config = cfg.to_server_config().unwrap();

    let transport = ServerTransport::Tcp(TcpServerTransport::new(true, config.max_payload));
    let mut server = DoipServer::new(config, transport);
    assert!(server.setup_tcp(default_factory()).await.is_err());
    assert!(!server.is_running());
    server.stop().await;
}
