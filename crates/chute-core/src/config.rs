//! Configuration system for chuted.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CHUTED_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/chuted/config.toml
//!   3. ~/.config/chuted/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChutedConfig {
    pub paths: PathsConfig,
    pub runtime: RuntimeConfig,
    pub confd: ConfdConfig,
    pub installer: InstallerConfig,
    pub controller: ControllerConfig,
    pub reporter: ReporterConfig,
    pub network: NetworkConfig,
    pub resources: ResourcesConfig,
    pub manager: ManagerConfig,
    pub intake: IntakeConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Chute registry (YAML).
    pub chute_store: PathBuf,
    /// Host configuration (YAML).
    pub host_config: PathBuf,
    /// Directory holding the generated network/firewall/dhcp/wireless files.
    pub os_config_dir: PathBuf,
    /// Root of the sysfs tree probed for network devices.
    pub sysfs_root: PathBuf,
    /// Per-chute persistent data volumes live under here.
    pub chute_data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container engine CLI.
    pub binary: PathBuf,
    /// Deadline for one runtime call, in seconds. Image builds get 10x.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfdConfig {
    pub socket: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub socket: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller base URL. Empty = progress is kept local only.
    pub url: String,
    pub router_id: String,
    /// Bearer token for controller requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Messages buffered between the worker and the reporter task.
    pub queue_capacity: usize,
    /// Lines kept in the local ring buffer.
    pub ring_size: usize,
    /// Messages held for the controller while it is unreachable. Oldest dropped first.
    pub retry_queue: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pool chute subnets are carved from.
    pub chute_subnet_pool: String,
    /// Prefix length of each chute interface subnet.
    pub chute_prefix: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Memory limit for services that do not request one. 0 = unlimited.
    pub default_memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Pending updates accepted before `add` reports the queue as full.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub zerotier_cli: PathBuf,
    /// File the telemetry agent reads its container targets from.
    pub telemetry_targets: PathBuf,
    /// File the telemetry agent reads its settings from.
    pub telemetry_settings: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PathsConfig {
    fn default() -> Self {
        let state = state_dir();
        Self {
            chute_store: state.join("chutes.yaml"),
            host_config: state.join("hostconfig.yaml"),
            os_config_dir: state.join("os-config"),
            sysfs_root: PathBuf::from("/sys"),
            chute_data_dir: state.join("data"),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            timeout_secs: 60,
        }
    }
}

impl Default for ConfdConfig {
    fn default() -> Self {
        Self {
            socket: runtime_dir().join("confd.sock"),
            timeout_secs: 30,
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            socket: runtime_dir().join("installer.sock"),
            timeout_secs: 10,
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            ring_size: 512,
            retry_queue: 256,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chute_subnet_pool: "192.168.128.0/17".to_string(),
            chute_prefix: 24,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            socket: runtime_dir().join("chuted.sock"),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        let state = state_dir();
        Self {
            zerotier_cli: PathBuf::from("zerotier-cli"),
            telemetry_targets: state.join("telemetry").join("targets.json"),
            telemetry_settings: state.join("telemetry").join("settings.json"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("chuted")
}

/// Persistent state directory (`$XDG_STATE_HOME/chuted`).
pub fn state_dir() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("state"))
        .join("chuted")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run"))
        .join("chuted")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ChutedConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            ChutedConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CHUTED_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            let text = toml::to_string_pretty(&ChutedConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            crate::fs::write_atomic(&path, text.as_bytes())
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CHUTED_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHUTED_PATHS__CHUTE_STORE") {
            self.paths.chute_store = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUTED_PATHS__HOST_CONFIG") {
            self.paths.host_config = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUTED_PATHS__OS_CONFIG_DIR") {
            self.paths.os_config_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUTED_RUNTIME__BINARY") {
            self.runtime.binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUTED_RUNTIME__TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.runtime.timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CHUTED_CONFD__SOCKET") {
            self.confd.socket = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUTED_CONTROLLER__URL") {
            self.controller.url = v;
        }
        if let Ok(v) = std::env::var("CHUTED_CONTROLLER__ROUTER_ID") {
            self.controller.router_id = v;
        }
        if let Ok(v) = std::env::var("CHUTED_CONTROLLER__TOKEN") {
            self.controller.token = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ChutedConfig::default();
        assert_eq!(config.network.chute_prefix, 24);
        assert_eq!(config.manager.queue_capacity, 64);
        assert!(config.controller.url.is_empty());
        assert!(config.paths.chute_store.ends_with("chutes.yaml"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let text = "[runtime]\ntimeout_secs = 5\n";
        let config: ChutedConfig = toml::from_str(text).unwrap();
        assert_eq!(config.runtime.timeout_secs, 5);
        assert_eq!(config.runtime.binary, PathBuf::from("docker"));
        assert_eq!(config.reporter.ring_size, 512);
    }

    #[test]
    fn load_from_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!(
            "chuted-config-missing-{}.toml",
            std::process::id()
        ));
        let config = ChutedConfig::load_from(&path).expect("load should succeed");
        assert_eq!(config.confd.timeout_secs, 30);
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&ChutedConfig::default()).unwrap();
        let back: ChutedConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.chute_subnet_pool, "192.168.128.0/17");
    }
}
