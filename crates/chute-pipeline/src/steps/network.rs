//! Internal network layout for chute interfaces.
//!
//! Every chute interface gets a network section `<chute>_<iface>`, a host-side
//! veth (at most 15 characters), a container-side `ethN`, and a subnet from
//! the chute pool. A chute keeps the subnet it already holds in the network
//! file; new subnets avoid every other owner's subnets and the host LAN.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chute_core::fs::read_optional;
use chute_core::{Chute, DhcpSpec, HostConfig, InterfaceType, WirelessSpec};
use ipnetwork::Ipv4Network;

use super::devices::SystemDevices;
use super::StepEnv;
use crate::error::{PipelineError, Result};
use crate::step::StepOutcome;
use crate::uci::{ConfigFile, ConfigKind, Section};
use crate::update::{keys, sections_key, CacheValue, Update, UpdateType};

/// Linux limit on interface names.
pub const MAX_INTF_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChuteInterface {
    pub service: String,
    pub name: String,
    pub kind: InterfaceType,
    /// Network section name.
    pub network: String,
    pub host_intf: String,
    pub container_intf: String,
    pub subnet: Ipv4Network,
    pub dhcp: Option<DhcpSpec>,
    pub wireless: Option<WirelessSpec>,
    /// Radio serving a `wifi-ap` interface.
    pub device: Option<String>,
}

impl ChuteInterface {
    /// First host address; the host side of the link.
    pub fn host_addr(&self) -> Ipv4Addr {
        offset(self.subnet, 1)
    }

    pub fn container_addr(&self) -> Ipv4Addr {
        offset(self.subnet, 2)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.subnet.mask()
    }
}

fn offset(net: Ipv4Network, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()).saturating_add(n))
}

/// Host-side interface name for `iface` of `chute`.
pub fn host_interface_name(chute: &str, iface: &str) -> String {
    let candidate = format!("v{chute}.{iface}");
    if candidate.len() <= MAX_INTF_LEN {
        return candidate;
    }
    let digest = blake3::hash(format!("{chute}/{iface}").as_bytes());
    let hex = hex::encode(digest.as_bytes());
    format!("v{}", &hex[..MAX_INTF_LEN - 1])
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn section_subnet(section: &Section) -> Option<Ipv4Network> {
    let addr: Ipv4Addr = section.get("ipaddr")?.parse().ok()?;
    let mask: Ipv4Addr = section.get("netmask")?.parse().ok()?;
    let net = Ipv4Network::with_netmask(addr, mask).ok()?;
    Ipv4Network::new(net.network(), net.prefix()).ok()
}

/// Subnets per network section name, reusing what `chute` already holds.
pub fn allocate_subnets(
    chute: &str,
    sections: &[String],
    existing: &ConfigFile,
    host_lan: Ipv4Network,
    pool: Ipv4Network,
    prefix: u8,
) -> Result<BTreeMap<String, Ipv4Network>> {
    let mut taken: Vec<Ipv4Network> = vec![host_lan];
    let mut held: BTreeMap<String, Ipv4Network> = BTreeMap::new();
    for section in existing.sections.iter().filter(|s| s.kind == "interface") {
        let Some(net) = section_subnet(section) else {
            continue;
        };
        match (section.owner.as_deref(), section.name.as_ref()) {
            (Some(owner), Some(name)) if owner == chute => {
                held.insert(name.clone(), net);
            }
            _ => taken.push(net),
        }
    }

    let mut out = BTreeMap::new();
    for name in sections {
        if let Some(net) = held.get(name) {
            if !taken.iter().any(|t| overlaps(*t, *net)) {
                out.insert(name.clone(), *net);
                taken.push(*net);
                continue;
            }
        }
        let net = next_free(pool, prefix, &taken).ok_or_else(|| {
            PipelineError::Validation(format!("no free /{prefix} subnet left in {pool}"))
        })?;
        out.insert(name.clone(), net);
        taken.push(net);
    }
    Ok(out)
}

fn next_free(pool: Ipv4Network, prefix: u8, taken: &[Ipv4Network]) -> Option<Ipv4Network> {
    let start = u64::from(u32::from(pool.network()));
    let size = 1u64 << (32 - u32::from(prefix));
    let count = 1u64 << (u32::from(prefix) - u32::from(pool.prefix()));
    (0..count)
        .filter_map(|i| {
            let addr = u32::try_from(start + i * size).ok()?;
            Ipv4Network::new(Ipv4Addr::from(addr), prefix).ok()
        })
        .find(|candidate| !taken.iter().any(|t| overlaps(*t, *candidate)))
}

/// Lay out every interface of `chute`.
pub fn layout(
    chute: &Chute,
    existing: &ConfigFile,
    host: &HostConfig,
    devices: &SystemDevices,
    pool: Ipv4Network,
    prefix: u8,
) -> Result<Vec<ChuteInterface>> {
    let section_names: Vec<String> = chute
        .interfaces()
        .map(|(_, iface, _)| format!("{}_{}", chute.name, iface))
        .collect();
    let (lan_addr, lan_prefix) = host.lan_prefix();
    let host_lan = Ipv4Network::new(lan_addr, lan_prefix)
        .map_err(|e| PipelineError::Validation(format!("host LAN: {e}")))?;
    let subnets = allocate_subnets(&chute.name, &section_names, existing, host_lan, pool, prefix)?;

    let radios: Vec<&str> = if host.wifi.is_empty() {
        devices.wifi.iter().map(String::as_str).collect()
    } else {
        host.wifi.iter().map(|w| w.id.as_str()).collect()
    };

    let mut out = Vec::new();
    for service in chute.services.values() {
        for (index, (iface, spec)) in service.interfaces.iter().enumerate() {
            let network = format!("{}_{}", chute.name, iface);
            let subnet = subnets.get(&network).copied().ok_or_else(|| {
                PipelineError::Internal(format!("no subnet allocated for {network}"))
            })?;
            let device = if spec.kind.is_wireless() {
                let wanted = spec.requirements.get("device").map(String::as_str);
                let found = match wanted {
                    Some(w) => radios.iter().find(|r| **r == w).copied(),
                    None => radios.first().copied(),
                };
                Some(
                    found
                        .ok_or_else(|| {
                            PipelineError::Validation(format!(
                                "no wireless device available for interface {iface}"
                            ))
                        })?
                        .to_string(),
                )
            } else {
                None
            };
            let dhcp = match (&spec.dhcp, spec.kind) {
                (Some(d), _) => Some(d.clone()),
                (None, InterfaceType::WifiAp) => Some(DhcpSpec::default()),
                (None, _) => None,
            };
            out.push(ChuteInterface {
                service: service.name.clone(),
                name: iface.clone(),
                kind: spec.kind,
                network,
                host_intf: host_interface_name(&chute.name, iface),
                container_intf: format!("eth{}", index + 1),
                subnet,
                dhcp,
                wireless: spec.wireless.clone(),
                device,
            });
        }
    }
    Ok(out)
}

pub fn network_sections(interfaces: &[ChuteInterface]) -> Vec<Section> {
    interfaces
        .iter()
        .map(|i| {
            let section = Section::new("interface", &i.network);
            let section = if i.kind == InterfaceType::WifiAp {
                section.option("type", "bridge")
            } else {
                section
            };
            section
                .option("proto", "static")
                .option("ifname", &i.host_intf)
                .option("ipaddr", i.host_addr())
                .option("netmask", i.netmask())
        })
        .collect()
}

pub fn host_network_sections(host: &HostConfig) -> Vec<Section> {
    let mut sections = vec![Section::new("interface", "lan")
        .option("type", "bridge")
        .option("ifname", host.lan.interfaces.join(" "))
        .option("proto", &host.lan.proto)
        .option("ipaddr", host.lan.ipaddr)
        .option("netmask", host.lan.netmask)];
    if !host.wan.interface.is_empty() {
        sections.push(
            Section::new("interface", "wan")
                .option("ifname", &host.wan.interface)
                .option("proto", &host.wan.proto),
        );
    }
    sections
}

pub fn compute(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let host = update.cache.host_config().cloned().unwrap_or_default();

    if update.is_host_scope() {
        update.cache.set(
            sections_key(ConfigKind::Network),
            CacheValue::Sections(host_network_sections(&host)),
        );
        return Ok(StepOutcome::Done);
    }

    let path = ConfigKind::Network.path(&env.settings.os_config_dir);
    let text = read_optional(&path)
        .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
    let existing = ConfigFile::parse(text.as_deref().unwrap_or(""))?;
    let devices = update.cache.devices().cloned().unwrap_or_default();
    let lay_out = |chute: &Chute| {
        layout(
            chute,
            &existing,
            &host,
            &devices,
            env.settings.subnet_pool,
            env.settings.chute_prefix,
        )
    };

    // Containers recreated by rollback get back the subnets the chute holds now.
    if matches!(update.kind(), UpdateType::Update | UpdateType::Delete) {
        if let Some(old) = &update.old {
            match lay_out(old) {
                Ok(previous) => update
                    .cache
                    .set(keys::PREVIOUS_INTERFACES, CacheValue::Interfaces(previous)),
                Err(e) => {
                    tracing::warn!(chute = %old.name, error = %e, "previous layout unavailable")
                }
            }
        }
    }

    let interfaces = match update.desired() {
        Some(chute) => lay_out(chute)?,
        None => Vec::new(),
    };

    for i in &interfaces {
        tracing::debug!(chute = %update.name(), network = %i.network, subnet = %i.subnet, host = %i.host_intf, "interface laid out");
    }
    update.cache.set(
        sections_key(ConfigKind::Network),
        CacheValue::Sections(network_sections(&interfaces)),
    );
    update
        .cache
        .set(keys::INTERFACES, CacheValue::Interfaces(interfaces));
    Ok(StepOutcome::Done)
}
