//! Chute model: the deployment unit a node installs and runs.
//!
//! A chute is one or more container services plus the network and wireless
//! interfaces they expose. Descriptors arrive as a loose `ChuteSpec` and are
//! turned into a validated `Chute` by `Chute::build`, which is the only way
//! the pipeline constructs a desired chute.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Longest chute name accepted. Host-side interface names are derived from it.
pub const MAX_NAME_LEN: usize = 64;

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Lifecycle state of a chute, as recorded in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChuteState {
    #[default]
    Invalid,
    Disabled,
    Running,
    Frozen,
    Stopped,
}

impl std::fmt::Display for ChuteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChuteState::Invalid => "invalid",
            ChuteState::Disabled => "disabled",
            ChuteState::Running => "running",
            ChuteState::Frozen => "frozen",
            ChuteState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How a service's image is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Built on the node from a named base runtime (`python2`, `node`, ...).
    #[default]
    Light,
    /// An external image reference, used verbatim.
    Image,
    /// Built on the node from the chute's source directory.
    Normal,
}

/// Kind of network interface a service asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceType {
    WifiAp,
    Lan,
    Monitor,
    Vlan,
}

impl InterfaceType {
    /// Interfaces that need a wireless device on the host.
    pub fn is_wireless(self) -> bool {
        matches!(self, InterfaceType::WifiAp | InterfaceType::Monitor)
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Container command, given either as a shell line or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn argv(&self) -> Vec<String> {
        match self {
            Command::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Command::Argv(args) => args.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Command::Line(line) => line.trim().is_empty(),
            Command::Argv(args) => args.is_empty(),
        }
    }
}

/// DHCP range served on a chute interface. Offsets are relative to the subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpSpec {
    pub start: u32,
    pub limit: u32,
    pub lease: String,
}

impl Default for DhcpSpec {
    fn default() -> Self {
        Self {
            start: 100,
            limit: 50,
            lease: "12h".to_string(),
        }
    }
}

/// Wireless access point settings for a `wifi-ap` interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessSpec {
    pub ssid: String,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

fn default_encryption() -> String {
    "none".to_string()
}

/// One interface requested by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireless: Option<WirelessSpec>,
    /// Hardware requirements matched against host devices (`hwmode`, `device`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, String>,
}

/// Host port published to a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container: u16,
    pub host: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Capabilities, ports and resource shares requested by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRequests {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(rename = "port-bindings", skip_serializing_if = "Vec::is_empty")]
    pub port_bindings: Vec<PortBinding>,
    /// Fraction of node CPU reserved for this service, in (0, 1].
    #[serde(rename = "cpu-fraction", skip_serializing_if = "Option::is_none")]
    pub cpu_fraction: Option<f64>,
    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// One container within a chute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interfaces: BTreeMap<String, InterfaceSpec>,
    #[serde(default)]
    pub requests: ServiceRequests,
}

/// Developer-supplied port redirect from the WAN side into a chute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleSpec {
    pub name: String,
    /// Chute interface the traffic is redirected to.
    pub interface: String,
    pub from_port: u16,
    pub to_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

// ── Chute ─────────────────────────────────────────────────────────────────────

/// An installed (or desired) chute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chute {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub state: ChuteState,
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall: Vec<FirewallRuleSpec>,
    /// Free-form build metadata. `source` names the build context for normal services.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build: BTreeMap<String, serde_json::Value>,
    /// Non-fatal findings recorded when the chute was built.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Loose chute descriptor as supplied by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChuteSpec {
    pub version: Option<u64>,
    pub services: Option<BTreeMap<String, Service>>,
    pub owner: Option<String>,
    pub environment: Option<BTreeMap<String, String>>,
    pub firewall: Option<Vec<FirewallRuleSpec>>,
    pub build: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChuteError {
    #[error("invalid chute name: {0:?}")]
    InvalidName(String),
    #[error("chute {0} has no services")]
    NoServices(String),
    #[error("invalid service name {service:?} in chute {chute}")]
    InvalidServiceName { chute: String, service: String },
    #[error("service {service} cannot resolve an image: {reason}")]
    UnresolvableImage { service: String, reason: String },
    #[error("interface {interface} of service {service}: {reason}")]
    InvalidInterface {
        service: String,
        interface: String,
        reason: String,
    },
    #[error("invalid resource request for service {service}: {reason}")]
    InvalidRequest { service: String, reason: String },
    #[error("firewall rule {rule}: {reason}")]
    InvalidFirewallRule { rule: String, reason: String },
}

fn valid_identifier(s: &str, max: usize) -> bool {
    !s.is_empty()
        && s.len() <= max
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Chute {
    /// Build a desired chute from a descriptor.
    ///
    /// Fields the descriptor leaves out are inherited from `old` when given,
    /// which is how start/stop/restart carry the installed definition forward.
    pub fn build(
        name: &str,
        spec: ChuteSpec,
        old: Option<&Chute>,
        state: ChuteState,
    ) -> Result<Chute, ChuteError> {
        if !valid_identifier(name, MAX_NAME_LEN) {
            return Err(ChuteError::InvalidName(name.to_string()));
        }

        let mut chute = Chute {
            name: name.to_string(),
            version: spec
                .version
                .or(old.map(|o| o.version))
                .unwrap_or(1),
            state,
            services: spec
                .services
                .or_else(|| old.map(|o| o.services.clone()))
                .unwrap_or_default(),
            owner: spec.owner.or_else(|| old.and_then(|o| o.owner.clone())),
            environment: spec
                .environment
                .or_else(|| old.map(|o| o.environment.clone()))
                .unwrap_or_default(),
            firewall: spec
                .firewall
                .or_else(|| old.map(|o| o.firewall.clone()))
                .unwrap_or_default(),
            build: spec
                .build
                .or_else(|| old.map(|o| o.build.clone()))
                .unwrap_or_default(),
            warnings: Vec::new(),
        };

        for (key, service) in chute.services.iter_mut() {
            service.name = key.clone();
        }

        chute.warnings = chute.validate()?;
        Ok(chute)
    }

    /// Check structural invariants. Returns non-fatal warnings on success.
    pub fn validate(&self) -> Result<Vec<String>, ChuteError> {
        if !valid_identifier(&self.name, MAX_NAME_LEN) {
            return Err(ChuteError::InvalidName(self.name.clone()));
        }
        if self.state == ChuteState::Running && self.services.is_empty() {
            return Err(ChuteError::NoServices(self.name.clone()));
        }

        let mut warnings = Vec::new();
        let mut host_ports = std::collections::BTreeSet::new();
        let mut cpu_total = 0.0;

        for (key, service) in &self.services {
            if !valid_identifier(key, 32) {
                return Err(ChuteError::InvalidServiceName {
                    chute: self.name.clone(),
                    service: key.clone(),
                });
            }
            if self.state == ChuteState::Running {
                self.check_image(service)?;
            }
            if service.kind == ServiceType::Light
                && service.command.as_ref().map_or(true, Command::is_empty)
            {
                warnings.push(format!(
                    "service {key} has no command; the base image default will run"
                ));
            }

            for (iface, spec) in &service.interfaces {
                check_interface(key, iface, spec)?;
            }

            for binding in &service.requests.port_bindings {
                let slot = (binding.host, binding.protocol.clone());
                if !host_ports.insert(slot) {
                    return Err(ChuteError::InvalidRequest {
                        service: key.clone(),
                        reason: format!("host port {} bound twice", binding.host),
                    });
                }
            }

            if let Some(fraction) = service.requests.cpu_fraction {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(ChuteError::InvalidRequest {
                        service: key.clone(),
                        reason: format!("cpu-fraction {fraction} outside (0, 1]"),
                    });
                }
                cpu_total += fraction;
            }
        }

        if cpu_total > 1.0 + f64::EPSILON {
            warnings.push(format!(
                "requested cpu fractions sum to {cpu_total:.2}; shares will be scaled"
            ));
        }

        for rule in &self.firewall {
            if self.interface(&rule.interface).is_none() {
                return Err(ChuteError::InvalidFirewallRule {
                    rule: rule.name.clone(),
                    reason: format!("no interface named {}", rule.interface),
                });
            }
        }

        Ok(warnings)
    }

    fn check_image(&self, service: &Service) -> Result<(), ChuteError> {
        let unresolvable = |reason: &str| ChuteError::UnresolvableImage {
            service: service.name.clone(),
            reason: reason.to_string(),
        };
        match service.kind {
            ServiceType::Light | ServiceType::Image => match service.image.as_deref() {
                Some(image) if !image.trim().is_empty() => Ok(()),
                _ => Err(unresolvable("no image named")),
            },
            ServiceType::Normal => match self.source_dir() {
                Some(_) => Ok(()),
                None => Err(unresolvable("normal service without build.source")),
            },
        }
    }

    /// Container name for a service of this chute.
    ///
    /// Single-service chutes keep the bare chute name.
    pub fn container_name(&self, service: &str) -> String {
        if self.services.len() <= 1 {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, service)
        }
    }

    /// Image the service's container runs.
    pub fn image_tag(&self, service: &Service) -> String {
        match (service.kind, service.image.as_deref()) {
            (ServiceType::Image, Some(reference)) => reference.to_string(),
            _ if self.services.len() <= 1 => format!("{}:{}", self.name, self.version),
            _ => format!("{}-{}:{}", self.name, service.name, self.version),
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        self.services
            .keys()
            .map(|s| self.container_name(s))
            .collect()
    }

    /// Build context for normal services.
    pub fn source_dir(&self) -> Option<PathBuf> {
        self.build
            .get("source")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }

    /// All interfaces across services, in (service, interface) order.
    pub fn interfaces(&self) -> impl Iterator<Item = (&Service, &str, &InterfaceSpec)> {
        self.services.values().flat_map(|service| {
            service
                .interfaces
                .iter()
                .map(move |(name, spec)| (service, name.as_str(), spec))
        })
    }

    pub fn interface(&self, name: &str) -> Option<(&Service, &InterfaceSpec)> {
        self.interfaces()
            .find(|(_, iface, _)| *iface == name)
            .map(|(service, _, spec)| (service, spec))
    }

    /// Combined CPU fraction the chute reserves, if any service asked for one.
    pub fn cpu_fraction(&self) -> Option<f64> {
        let requested: Vec<f64> = self
            .services
            .values()
            .filter_map(|s| s.requests.cpu_fraction)
            .collect();
        if requested.is_empty() {
            None
        } else {
            Some(requested.iter().sum::<f64>().min(1.0))
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ChuteState::Running
    }
}

fn check_interface(service: &str, iface: &str, spec: &InterfaceSpec) -> Result<(), ChuteError> {
    let invalid = |reason: String| ChuteError::InvalidInterface {
        service: service.to_string(),
        interface: iface.to_string(),
        reason,
    };

    if !valid_identifier(iface, 15) {
        return Err(invalid("interface names are 1-15 of [A-Za-z0-9_-]".into()));
    }
    if spec.kind == InterfaceType::WifiAp {
        match &spec.wireless {
            Some(w) if !w.ssid.is_empty() && w.ssid.len() <= 32 => {}
            Some(_) => return Err(invalid("ssid must be 1-32 bytes".into())),
            None => return Err(invalid("wifi-ap requires a wireless section".into())),
        }
        if let Some(w) = &spec.wireless {
            if w.encryption != "none" && w.key.as_ref().map_or(true, |k| k.len() < 8) {
                return Err(invalid(format!(
                    "encryption {} requires a key of at least 8 characters",
                    w.encryption
                )));
            }
        }
    } else if spec.wireless.is_some() {
        return Err(invalid("wireless settings only apply to wifi-ap".into()));
    }
    if let Some(dhcp) = &spec.dhcp {
        if dhcp.limit == 0 || dhcp.start == 0 || dhcp.start + dhcp.limit > 254 {
            return Err(invalid(format!(
                "dhcp range {}+{} does not fit a /24",
                dhcp.start, dhcp.limit
            )));
        }
    }
    Ok(())
}
