// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Gateway configuration.
//!
//! Two layers: [`GatewayConfig`] is the JSON5 file format (comments and
//! trailing commas allowed, every field optional with a default), and
//! [`ServerConfig`] is the validated runtime configuration the server core
//! consumes. The core stays configurable programmatically; the file format
//! is the outer shell's concern.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionTimings;
use crate::message::{Eid, Gid, Vin, DEFAULT_MAX_PAYLOAD};
use crate::model::ServerIdentity;
use crate::{is_tester_address, LogicalAddress, ZERO_ADDRESS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid VIN {vin:?}: {reason}")]
    InvalidVin { vin: String, reason: String },

    #[error("invalid hardware identifier {0:?}, expected 6 hex bytes like aa:bb:cc:dd:ee:ff")]
    InvalidHardwareId(String),

    #[error("logical address {0:#06x} is reserved or inside the tester pool")]
    InvalidLogicalAddress(LogicalAddress),

    #[error("announce interval must be greater than zero")]
    ZeroAnnounceInterval,

    #[error("maximum payload must be at least 64 KiB, got {0}")]
    MaxPayloadTooSmall(usize),
}

/// Timeout overrides in the file format, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "default_initial_inactivity_ms")]
    pub initial_inactivity_ms: u64,
    #[serde(default = "default_general_inactivity_ms")]
    pub general_inactivity_ms: u64,
    #[serde(default = "default_alive_check_ms")]
    pub alive_check_ms: u64,
    #[serde(default = "default_downstream_response_ms")]
    pub downstream_response_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            initial_inactivity_ms: default_initial_inactivity_ms(),
            general_inactivity_ms: default_general_inactivity_ms(),
            alive_check_ms: default_alive_check_ms(),
            downstream_response_ms: default_downstream_response_ms(),
        }
    }
}

fn default_initial_inactivity_ms() -> u64 {
    2_000
}

fn default_general_inactivity_ms() -> u64 {
    300_000
}

fn default_alive_check_ms() -> u64 {
    500
}

fn default_downstream_response_ms() -> u64 {
    2_000
}

/// Startup configuration (JSON5 file format).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// 17-character vehicle identification number; all-zero when absent.
    #[serde(default)]
    pub vin: Option<String>,

    /// Logical address of the gateway.
    #[serde(default = "default_logical_address")]
    pub logical_address: u16,

    /// Entity id, e.g. "02:00:00:aa:bb:cc". All-zero when absent.
    #[serde(default)]
    pub eid: Option<String>,

    /// Group id, same format as `eid`.
    #[serde(default)]
    pub gid: Option<String>,

    /// Further-action byte announced to testers.
    #[serde(default)]
    pub further_action: u8,

    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// How many vehicle announcements to send after startup.
    #[serde(default = "default_announce_count")]
    pub announce_count: u32,

    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,

    /// Destination port of announcements; the standard test-equipment port
    /// when absent.
    #[serde(default)]
    pub announce_port: Option<u16>,

    /// Announce to 127.0.0.1 instead of the broadcast address.
    #[serde(default)]
    pub loopback: bool,

    /// Largest accepted payload in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Extra alive-check attempts after the first unanswered one.
    #[serde(default)]
    pub alive_check_retries: u8,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_logical_address() -> u16 {
    0x0201
}

fn default_tcp_port() -> u16 {
    crate::DOIP_SERVER_TCP_PORT
}

fn default_announce_count() -> u32 {
    3
}

fn default_announce_interval_ms() -> u64 {
    500
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            vin: None,
            logical_address: default_logical_address(),
            eid: None,
            gid: None,
            further_action: 0,
            tcp_port: default_tcp_port(),
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval_ms(),
            announce_port: None,
            loopback: false,
            max_payload: default_max_payload(),
            alive_check_retries: 0,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads and parses a JSON5 configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parses a JSON5 configuration string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serializes for `show`-style output. JSON5 accepts plain JSON, so the
    /// emit path uses serde_json's pretty printer.
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Validates and converts into the runtime configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let vin = match &self.vin {
            None => Vin::ZERO,
            Some(s) => Vin::new(s).map_err(|e| ConfigError::InvalidVin {
                vin: s.clone(),
                reason: e.to_string(),
            })?,
        };
        let eid = match &self.eid {
            None => Eid::ZERO,
            Some(s) => Eid::new(parse_hardware_id(s)?),
        };
        let gid = match &self.gid {
            None => Gid::ZERO,
            Some(s) => Gid::new(parse_hardware_id(s)?),
        };
        if self.logical_address == ZERO_ADDRESS || is_tester_address(self.logical_address) {
            return Err(ConfigError::InvalidLogicalAddress(self.logical_address));
        }
        if self.announce_interval_ms == 0 {
            return Err(ConfigError::ZeroAnnounceInterval);
        }
        if self.max_payload < DEFAULT_MAX_PAYLOAD {
            return Err(ConfigError::MaxPayloadTooSmall(self.max_payload));
        }

        Ok(ServerConfig {
            identity: ServerIdentity {
                vin,
                logical_address: self.logical_address,
                eid,
                gid,
                further_action: self.further_action,
            },
            tcp_port: self.tcp_port,
            announce_count: self.announce_count,
            announce_interval: Duration::from_millis(self.announce_interval_ms),
            announce_port: self
                .announce_port
                .unwrap_or(crate::DOIP_UDP_TEST_EQUIPMENT_REQUEST_PORT),
            loopback: self.loopback,
            max_payload: self.max_payload,
            alive_check_retries: self.alive_check_retries,
            timings: ConnectionTimings {
                initial_inactivity: Duration::from_millis(self.timeouts.initial_inactivity_ms),
                general_inactivity: Duration::from_millis(self.timeouts.general_inactivity_ms),
                alive_check: Duration::from_millis(self.timeouts.alive_check_ms),
                downstream_response: Duration::from_millis(self.timeouts.downstream_response_ms),
            },
        })
    }
}

/// Parses "aa:bb:cc:dd:ee:ff" (or without separators) into 6 bytes.
fn parse_hardware_id(s: &str) -> Result<[u8; 6], ConfigError> {
    let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidHardwareId(s.to_owned()));
    }
    let mut bytes = [0u8; 6];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).expect("hex digits");
        bytes[i] = u8::from_str_radix(pair, 16).expect("validated hex");
    }
    Ok(bytes)
}

/// Validated runtime configuration of one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub identity: ServerIdentity,
    pub tcp_port: u16,
    pub announce_count: u32,
    pub announce_interval: Duration,
    pub announce_port: u16,
    pub loopback: bool,
    pub max_payload: usize,
    pub alive_check_retries: u8,
    pub timings: ConnectionTimings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        GatewayConfig::default()
            .to_server_config()
            .expect("defaults validate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.tcp_port, 13400);
        assert_eq!(cfg.announce_count, 3);
        assert_eq!(cfg.identity.vin, Vin::ZERO);
        assert_eq!(cfg.timings.initial_inactivity, Duration::from_secs(2));
        assert_eq!(cfg.timings.general_inactivity, Duration::from_secs(300));
        assert_eq!(cfg.timings.alive_check, Duration::from_millis(500));
        assert_eq!(cfg.alive_check_retries, 0);
    }

    #[test]
    fn parses_json5_with_comments() {
        let cfg = GatewayConfig::parse(
            r#"{
                // gateway identity
                vin: "WVWZZZ1JZ3W386752",
                logical_address: 0x0240,
                eid: "02:00:5e:10:00:01",
                loopback: true,
                timeouts: { alive_check_ms: 750 },
            }"#,
        )
        .unwrap();
        let server = cfg.to_server_config().unwrap();
        assert_eq!(server.identity.logical_address, 0x0240);
        assert_eq!(
            server.identity.eid,
            Eid::new([0x02, 0x00, 0x5e, 0x10, 0x00, 0x01])
        );
        assert!(server.loopback);
        assert_eq!(server.timings.alive_check, Duration::from_millis(750));
        // Unset timeouts keep their defaults.
        assert_eq!(server.timings.initial_inactivity, Duration::from_secs(2));
    }

    #[test]
    fn rejects_bad_vin() {
        let cfg = GatewayConfig {
            vin: Some("TOO-SHORT".to_owned()),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            cfg.to_server_config(),
            Err(ConfigError::InvalidVin { .. })
        ));
    }

    #[test]
    fn rejects_tester_pool_gateway_address() {
        let cfg = GatewayConfig {
            logical_address: 0x0E42,
            ..GatewayConfig::default()
        };
        assert!(matches!(
            cfg.to_server_config(),
            Err(ConfigError::InvalidLogicalAddress(0x0E42))
        ));
    }

    #[test]
    fn rejects_bad_hardware_id() {
        assert!(parse_hardware_id("aa:bb:cc").is_err());
        assert!(parse_hardware_id("zz:zz:zz:zz:zz:zz").is_err());
        assert_eq!(
            parse_hardware_id("aa:bb:cc:dd:ee:ff").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
        assert_eq!(
            parse_hardware_id("aabbccddeeff").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
    }

    #[test]
    fn rejects_undersized_mtu() {
        let cfg = GatewayConfig {
            max_payload: 1024,
            ..GatewayConfig::default()
        };
        assert!(matches!(
            cfg.to_server_config(),
            Err(ConfigError::MaxPayloadTooSmall(1024))
        ));
    }

    #[test]
    fn emit_parse_roundtrip() {
        let cfg = GatewayConfig {
            vin: Some("ABCDEFGHIJKLMNOPQ".to_owned()),
            loopback: true,
            announce_count: 1,
            ..GatewayConfig::default()
        };
        let emitted = cfg.to_json5();
        let parsed = GatewayConfig::parse(&emitted).unwrap();
        assert_eq!(parsed, cfg);
    }
}
