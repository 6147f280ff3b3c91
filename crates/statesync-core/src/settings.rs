//! Device settings domains.
//!
//! Each type here is a serde schema used through [`JsonCodec`](crate::JsonCodec):
//! missing fields take their defaults, unknown fields are rejected and
//! [`Validate`] refuses anything the device could not apply.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::state::{Validate, ValidationError};

/// Most networks a device will remember.
pub const MAX_WIFI_NETWORKS: usize = 5;
pub const MAX_SSID_LEN: usize = 31;
pub const MAX_PASSWORD_LEN: usize = 64;

pub const DEFAULT_HOSTNAME: &str = "statesync-device";

fn hostname_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").ok())
        .as_ref()
}

fn server_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
            )
            .ok()
        })
        .as_ref()
}

fn mqtt_uri_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^mqtts?://[^\s/:]+(:\d{1,5})?(/\S*)?$").ok())
        .as_ref()
}

fn matches(pattern: Option<&Regex>, value: &str) -> bool {
    pattern.is_some_and(|p| p.is_match(value))
}

// ============================================================================
// Wi-Fi
// ============================================================================

/// One remembered network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiNetwork {
    pub ssid: String,
    pub password: String,
    pub static_ip_config: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ip_1: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ip_2: Option<Ipv4Addr>,
}

impl WifiNetwork {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    fn validate_at(mut self, index: usize) -> Result<Self, ValidationError> {
        let field = |name: &str| format!("wifi_networks[{index}].{name}");

        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return Err(ValidationError::new(
                field("ssid"),
                format!("must be 1 to {MAX_SSID_LEN} bytes"),
            ));
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(ValidationError::new(
                field("password"),
                format!("must be at most {MAX_PASSWORD_LEN} bytes"),
            ));
        }

        if !self.static_ip_config {
            // Addresses are only meaningful with a static configuration.
            self.local_ip = None;
            self.gateway_ip = None;
            self.subnet_mask = None;
            self.dns_ip_1 = None;
            self.dns_ip_2 = None;
            return Ok(self);
        }

        for (name, addr) in [
            ("local_ip", self.local_ip),
            ("gateway_ip", self.gateway_ip),
            ("subnet_mask", self.subnet_mask),
        ] {
            if addr.map_or(true, |a| a.is_unspecified()) {
                return Err(ValidationError::new(
                    field(name),
                    "required for a static IP configuration",
                ));
            }
        }

        if self.dns_ip_1.map_or(true, |a| a.is_unspecified()) {
            self.dns_ip_1 = self.dns_ip_2.take().filter(|a| !a.is_unspecified());
        }

        Ok(self)
    }
}

/// Station-mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiSettings {
    pub hostname: String,
    /// Connect to the strongest remembered network rather than the first.
    #[serde(rename = "priority_RSSI")]
    pub priority_rssi: bool,
    pub wifi_networks: Vec<WifiNetwork>,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            priority_rssi: true,
            wifi_networks: Vec::new(),
        }
    }
}

impl Validate for WifiSettings {
    fn validate(self) -> Result<Self, ValidationError> {
        if !matches(hostname_pattern(), &self.hostname) {
            return Err(ValidationError::new("hostname", "not a valid host name"));
        }
        if self.wifi_networks.len() > MAX_WIFI_NETWORKS {
            return Err(ValidationError::new(
                "wifi_networks",
                format!("at most {MAX_WIFI_NETWORKS} networks"),
            ));
        }

        let wifi_networks = self
            .wifi_networks
            .into_iter()
            .enumerate()
            .map(|(i, network)| network.validate_at(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            wifi_networks,
            ..self
        })
    }
}

// ============================================================================
// NTP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NtpSettings {
    pub enabled: bool,
    pub server: String,
    pub tz_label: String,
    /// POSIX TZ string, e.g. `GMT0BST,M3.5.0/1,M10.5.0`.
    pub tz_format: String,
}

impl Default for NtpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "time.google.com".to_string(),
            tz_label: "Europe/London".to_string(),
            tz_format: "GMT0BST,M3.5.0/1,M10.5.0".to_string(),
        }
    }
}

impl Validate for NtpSettings {
    fn validate(self) -> Result<Self, ValidationError> {
        if !matches(server_pattern(), &self.server) {
            return Err(ValidationError::new("server", "not a valid host name"));
        }
        if self.tz_format.trim().is_empty() {
            return Err(ValidationError::new("tz_format", "must not be empty"));
        }
        Ok(self)
    }
}

// ============================================================================
// MQTT
// ============================================================================

pub const MAX_KEEP_ALIVE_SECS: u16 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    pub enabled: bool,
    pub uri: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    /// Seconds.
    pub keep_alive: u16,
    pub clean_session: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: "mqtt://broker.local:1883".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: DEFAULT_HOSTNAME.to_string(),
            keep_alive: 60,
            clean_session: true,
        }
    }
}

impl Validate for MqttSettings {
    fn validate(self) -> Result<Self, ValidationError> {
        if !matches(mqtt_uri_pattern(), &self.uri) {
            return Err(ValidationError::new(
                "uri",
                "must start with mqtt:// or mqtts://",
            ));
        }
        if self.keep_alive == 0 || self.keep_alive > MAX_KEEP_ALIVE_SECS {
            return Err(ValidationError::new(
                "keep_alive",
                format!("must be 1 to {MAX_KEEP_ALIVE_SECS} seconds"),
            ));
        }
        if self.client_id.is_empty() {
            return Err(ValidationError::new("client_id", "must not be empty"));
        }
        Ok(self)
    }
}
