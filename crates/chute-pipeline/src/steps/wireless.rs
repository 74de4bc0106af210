//! Wireless section generator.
//!
//! Chute access points become `wifi-iface` sections on the radio chosen
//! during network layout. Host-scope updates emit the radios themselves and
//! the host's own access points.

use chute_core::{HostConfig, InterfaceType};

use super::network::ChuteInterface;
use crate::error::Result;
use crate::step::StepOutcome;
use crate::uci::{ConfigKind, Section};
use crate::update::{sections_key, CacheValue, Update};

pub fn chute_sections(interfaces: &[ChuteInterface]) -> Vec<Section> {
    interfaces
        .iter()
        .filter(|i| i.kind == InterfaceType::WifiAp)
        .filter_map(|i| {
            let wireless = i.wireless.as_ref()?;
            let device = i.device.as_deref()?;
            let mut section = Section::anonymous("wifi-iface")
                .option("device", device)
                .option("mode", "ap")
                .option("network", &i.network)
                .option("ssid", &wireless.ssid)
                .option("encryption", &wireless.encryption);
            if let Some(key) = &wireless.key {
                section = section.option("key", key);
            }
            if wireless.hidden {
                section = section.option("hidden", 1);
            }
            Some(section.option("ifname", &i.host_intf))
        })
        .collect()
}

pub fn host_sections(host: &HostConfig) -> Vec<Section> {
    let mut out: Vec<Section> = host
        .wifi
        .iter()
        .map(|radio| {
            let section = Section::new("wifi-device", &radio.id)
                .option("type", "auto")
                .option("channel", radio.channel)
                .option("hwmode", &radio.hwmode);
            match &radio.htmode {
                Some(ht) => section.option("htmode", ht),
                None => section,
            }
        })
        .collect();

    for ap in &host.wifi_interfaces {
        let mut section = Section::anonymous("wifi-iface")
            .option("device", &ap.device)
            .option("mode", &ap.mode)
            .option("network", &ap.network)
            .option("ssid", &ap.ssid)
            .option("encryption", &ap.encryption);
        if let Some(key) = &ap.key {
            section = section.option("key", key);
        }
        out.push(section);
    }
    out
}

pub fn get(update: &mut Update) -> Result<StepOutcome> {
    let sections = if update.is_host_scope() {
        let host = update.cache.host_config().cloned().unwrap_or_default();
        host_sections(&host)
    } else {
        chute_sections(update.cache.interfaces())
    };
    update.cache.set(
        sections_key(ConfigKind::Wireless),
        CacheValue::Sections(sections),
    );
    Ok(StepOutcome::Done)
}
