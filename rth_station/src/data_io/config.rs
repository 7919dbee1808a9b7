#![allow(dead_code)]
use serde::Deserialize;
use std::sync::Arc;
use std::fs;

lazy_static::lazy_static! {
    pub static ref APP_CONFIG: Arc<AppConfig> = {
        let config_file = "config.toml";
        let toml_str = fs::read_to_string(config_file)
            .expect(&format!("Failed to read configuration file: {}", config_file));
        let config = match toml::from_str(&toml_str) {
            Ok(t) => t,
            Err(e) => panic!("TOML parse fail {e:?}"),
        };
        Arc::new(config)
    };
}

/// Which side of the coupler this station emulates.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    #[serde(rename = "EV")]
    Ev,
    #[serde(rename = "EVSE")]
    Evse,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Ev => write!(f, "EV"),
            DeviceRole::Evse => write!(f, "EVSE"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub device_type: DeviceRole,
    /// Wait between sending a request over UART and reading its response.
    pub response_delay_ms: u64,
    pub serial_device: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub broker_ip: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    /// Data/handshake topic each station publishes on; each side subscribes
    /// to the other's.
    pub ev_message: String,
    pub evse_message: String,
    pub ev_status_topic: String,
    pub evse_status_topic: String,
    pub ev_state: String,
    pub evse_state: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Reachability probe target, e.g. "8.8.8.8:53".
    pub probe_addr: String,
    /// Port of the relay TCP session (EVSE listens, EV connects).
    pub relay_port: u16,
    /// IPv6 address advertised in the SDP response (EVSE only).
    pub local_ipv6: String,
    /// Scope id for the link-local discovery multicast (0 = default route).
    #[serde(default)]
    pub interface_index: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlacConfig {
    /// Command run to establish the powerline link, per role.
    pub ev_command: String,
    pub evse_command: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub mqtt: MqttConfig,
    pub network: NetworkConfig,
    pub slac: SlacConfig,
}

impl MqttConfig {
    /// Topic this role publishes data/handshake payloads on.
    pub fn data_topic(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::Ev => &self.ev_message,
            DeviceRole::Evse => &self.evse_message,
        }
    }
    /// Topic carrying the peer station's data/handshake payloads.
    pub fn peer_data_topic(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::Ev => &self.evse_message,
            DeviceRole::Evse => &self.ev_message,
        }
    }
    pub fn status_topic(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::Ev => &self.ev_status_topic,
            DeviceRole::Evse => &self.evse_status_topic,
        }
    }
    pub fn state_topic(&self, role: DeviceRole) -> &str {
        match role {
            DeviceRole::Ev => &self.ev_state,
            DeviceRole::Evse => &self.evse_state,
        }
    }
}
