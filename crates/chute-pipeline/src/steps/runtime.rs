//! Container preamble and DHCP generators.

use chute_core::HostConfig;
use rand::RngCore;

use super::network::ChuteInterface;
use super::StepEnv;
use crate::error::Result;
use crate::runtime::VolumeMount;
use crate::step::StepOutcome;
use crate::uci::{ConfigKind, Section};
use crate::update::{keys, sections_key, CacheValue, Update};

/// Mount point of the chute data volume inside every container.
pub const DATA_MOUNT: &str = "/data";

/// Fresh 128-bit API token, hex encoded.
pub fn api_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn get_preamble(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let volume = VolumeMount {
        host: update.data_dir(&env.settings.chute_data_dir),
        container: DATA_MOUNT.to_string(),
    };
    update
        .cache
        .set(keys::VOLUMES, CacheValue::Volumes(vec![volume]));
    update.cache.set(keys::API_TOKEN, CacheValue::Token(api_token()));
    Ok(StepOutcome::Done)
}

pub fn dhcp_sections(interfaces: &[ChuteInterface]) -> Vec<Section> {
    interfaces
        .iter()
        .filter_map(|i| {
            let dhcp = i.dhcp.as_ref()?;
            Some(
                Section::new("dhcp", &i.network)
                    .option("interface", &i.network)
                    .option("start", dhcp.start)
                    .option("limit", dhcp.limit)
                    .option("leasetime", &dhcp.lease),
            )
        })
        .collect()
}

pub fn host_dhcp_sections(host: &HostConfig) -> Vec<Section> {
    let lan = &host.lan.dhcp;
    let mut out = vec![
        Section::anonymous("dnsmasq")
            .option("domainneeded", 1)
            .option("localise_queries", 1)
            .option("leasefile", "/tmp/dhcp.leases"),
        Section::new("dhcp", "lan")
            .option("interface", "lan")
            .option("start", lan.start)
            .option("limit", lan.limit)
            .option("leasetime", &lan.leasetime),
    ];
    if !host.wan.interface.is_empty() {
        out.push(
            Section::new("dhcp", "wan")
                .option("interface", "wan")
                .option("ignore", 1),
        );
    }
    out
}

pub fn get_dhcp(update: &mut Update) -> Result<StepOutcome> {
    let sections = if update.is_host_scope() {
        let host = update.cache.host_config().cloned().unwrap_or_default();
        host_dhcp_sections(&host)
    } else {
        dhcp_sections(update.cache.interfaces())
    };
    update
        .cache
        .set(sections_key(ConfigKind::Dhcp), CacheValue::Sections(sections));
    Ok(StepOutcome::Done)
}
