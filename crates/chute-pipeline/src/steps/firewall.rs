//! Firewall section generators.

use chute_core::{FirewallRuleSpec, HostConfig};

use super::network::ChuteInterface;
use crate::error::{PipelineError, Result};
use crate::step::StepOutcome;
use crate::uci::{ConfigKind, Section};
use crate::update::{sections_key, CacheValue, Update};

/// One zone per chute interface, forwarded to the WAN.
pub fn zone_sections(interfaces: &[ChuteInterface]) -> Vec<Section> {
    let mut out = Vec::new();
    for i in interfaces {
        out.push(
            Section::anonymous("zone")
                .option("name", &i.network)
                .list("network", [&i.network])
                .option("input", "ACCEPT")
                .option("output", "ACCEPT")
                .option("forward", "REJECT"),
        );
        out.push(
            Section::anonymous("forwarding")
                .option("src", &i.network)
                .option("dest", "wan"),
        );
    }
    out
}

pub fn host_sections(host: &HostConfig) -> Vec<Section> {
    let mut out = vec![
        Section::anonymous("defaults")
            .option("input", "ACCEPT")
            .option("output", "ACCEPT")
            .option("forward", "REJECT"),
        Section::anonymous("zone")
            .option("name", "lan")
            .list("network", ["lan"])
            .option("input", "ACCEPT")
            .option("output", "ACCEPT")
            .option("forward", "ACCEPT"),
    ];
    if !host.wan.interface.is_empty() {
        out.push(
            Section::anonymous("zone")
                .option("name", "wan")
                .list("network", ["wan"])
                .option("input", "REJECT")
                .option("output", "ACCEPT")
                .option("forward", "REJECT")
                .option("masq", 1)
                .option("mtu_fix", 1),
        );
        out.push(
            Section::anonymous("forwarding")
                .option("src", "lan")
                .option("dest", "wan"),
        );
    }
    out
}

/// Port redirects from the WAN into the chute's containers.
pub fn redirect_sections(
    rules: &[FirewallRuleSpec],
    interfaces: &[ChuteInterface],
) -> Result<Vec<Section>> {
    rules
        .iter()
        .map(|rule| {
            let iface = interfaces
                .iter()
                .find(|i| i.name == rule.interface)
                .ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "firewall rule {} names unknown interface {}",
                        rule.name, rule.interface
                    ))
                })?;
            Ok(Section::anonymous("redirect")
                .option("name", &rule.name)
                .option("src", "wan")
                .option("proto", &rule.protocol)
                .option("src_dport", rule.from_port)
                .option("dest", &iface.network)
                .option("dest_ip", iface.container_addr())
                .option("dest_port", rule.to_port)
                .option("target", "DNAT"))
        })
        .collect()
}

pub fn get_os_rules(update: &mut Update) -> Result<StepOutcome> {
    let sections = if update.is_host_scope() {
        let host = update.cache.host_config().cloned().unwrap_or_default();
        host_sections(&host)
    } else {
        zone_sections(update.cache.interfaces())
    };
    update.cache.set(
        sections_key(ConfigKind::Firewall),
        CacheValue::Sections(sections),
    );
    Ok(StepOutcome::Done)
}

pub fn get_developer_rules(update: &mut Update) -> Result<StepOutcome> {
    let rules = match update.desired() {
        Some(chute) if !update.is_host_scope() => chute.firewall.clone(),
        _ => return Ok(StepOutcome::Done),
    };
    let redirects = redirect_sections(&rules, update.cache.interfaces())?;
    if !redirects.is_empty() {
        tracing::debug!(chute = %update.name(), count = redirects.len(), "developer redirects");
    }
    update.cache.push_sections(ConfigKind::Firewall, redirects);
    Ok(StepOutcome::Done)
}
