//! Host configuration: node-wide network, wireless and side-service settings.
//!
//! Stored as YAML with a fixed schema:
//!
//! ```yaml
//! wan: {interface: eth0, proto: dhcp}
//! lan: {interfaces: [eth1], proto: static, ipaddr: 192.168.1.1, netmask: 255.255.255.0,
//!       dhcp: {start: 100, limit: 100, leasetime: 12h}}
//! wifi: [{id: wlan0, channel: 1, hwmode: 11g}]
//! wifi-interfaces: [{device: wlan0, ssid: node, mode: ap, network: lan, encryption: none}]
//! telemetry: {enabled: true, interval: 60}
//! zerotier: {enabled: false, networks: []}
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fs::{read_optional, write_atomic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WanConfig {
    pub interface: String,
    pub proto: String,
}

impl Default for WanConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            proto: "dhcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanDhcp {
    pub start: u32,
    pub limit: u32,
    pub leasetime: String,
}

impl Default for LanDhcp {
    fn default() -> Self {
        Self {
            start: 100,
            limit: 100,
            leasetime: "12h".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanConfig {
    pub interfaces: Vec<String>,
    pub proto: String,
    pub ipaddr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: LanDhcp,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            proto: "static".to_string(),
            ipaddr: Ipv4Addr::new(192, 168, 1, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dhcp: LanDhcp::default(),
        }
    }
}

/// A physical radio. `id` is the host interface the radio appears as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiDevice {
    pub id: String,
    #[serde(default = "default_channel")]
    pub channel: u32,
    #[serde(default = "default_hwmode")]
    pub hwmode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htmode: Option<String>,
}

fn default_channel() -> u32 {
    1
}

fn default_hwmode() -> String {
    "11g".to_string()
}

/// A host-owned access point on one of the radios.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiInterface {
    pub device: String,
    pub ssid: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_mode() -> String {
    "ap".to_string()
}

fn default_network() -> String {
    "lan".to_string()
}

fn default_encryption() -> String {
    "none".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Seconds between samples.
    pub interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZerotierConfig {
    pub enabled: bool,
    pub networks: Vec<String>,
}

/// Node-wide settings, distinct from any chute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub wan: WanConfig,
    pub lan: LanConfig,
    pub wifi: Vec<WifiDevice>,
    #[serde(rename = "wifi-interfaces")]
    pub wifi_interfaces: Vec<WifiInterface>,
    pub telemetry: TelemetryConfig,
    pub zerotier: ZerotierConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum HostConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_yaml::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize host config: {0}")]
    SerializeFailed(serde_yaml::Error),
    #[error("host config does not match schema: {0}")]
    Schema(serde_json::Error),
}

impl HostConfig {
    /// Default config for a node with the given ethernet and wifi interfaces.
    ///
    /// The first ethernet port becomes the WAN; the rest are bridged into the LAN.
    /// Every radio gets one host access point on the LAN.
    pub fn generate(ethernet: &[String], wifi: &[String]) -> HostConfig {
        let mut config = HostConfig::default();
        if let Some((wan, lan)) = ethernet.split_first() {
            config.wan.interface = wan.clone();
            config.lan.interfaces = lan.to_vec();
        }
        for (index, id) in wifi.iter().enumerate() {
            config.wifi.push(WifiDevice {
                id: id.clone(),
                channel: if index == 0 { 1 } else { 36 },
                hwmode: if index == 0 { "11g" } else { "11a" }.to_string(),
                htmode: None,
            });
        }
        if let Some(first) = wifi.first() {
            config.wifi_interfaces.push(WifiInterface {
                device: first.clone(),
                ssid: "chuted".to_string(),
                mode: default_mode(),
                network: default_network(),
                encryption: default_encryption(),
                key: None,
            });
        }
        config
    }

    pub fn load(path: &Path) -> Result<HostConfig, HostConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| HostConfigError::ReadFailed(path.to_path_buf(), e))?;
        serde_yaml::from_str(&text).map_err(|e| HostConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Load the config, or `None` if the file does not exist yet.
    pub fn load_optional(path: &Path) -> Result<Option<HostConfig>, HostConfigError> {
        match read_optional(path).map_err(|e| HostConfigError::ReadFailed(path.to_path_buf(), e))? {
            Some(text) => serde_yaml::from_str(&text)
                .map(Some)
                .map_err(|e| HostConfigError::ParseFailed(path.to_path_buf(), e)),
            None => Ok(None),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), HostConfigError> {
        let text = serde_yaml::to_string(self).map_err(HostConfigError::SerializeFailed)?;
        write_atomic(path, text.as_bytes())
            .map_err(|e| HostConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// JSON view used for patching.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: serde_json::Value) -> Result<HostConfig, HostConfigError> {
        serde_json::from_value(value).map_err(HostConfigError::Schema)
    }

    /// LAN subnet as (network address, prefix length).
    pub fn lan_prefix(&self) -> (Ipv4Addr, u8) {
        let mask = u32::from(self.lan.netmask);
        let network = u32::from(self.lan.ipaddr) & mask;
        (Ipv4Addr::from(network), mask.count_ones() as u8)
    }
}
