//! System device detection from sysfs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::StepEnv;
use crate::error::{PipelineError, Result};
use crate::step::StepOutcome;
use crate::update::{keys, CacheValue, Update};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDevices {
    pub ethernet: Vec<String>,
    pub wifi: Vec<String>,
}

/// Classify the physical interfaces under `<sysfs>/class/net`.
///
/// Interfaces without a `device` link (loopback, bridges, veths) are skipped.
pub fn detect(sysfs_root: &Path) -> std::io::Result<SystemDevices> {
    let dir = sysfs_root.join("class").join("net");
    let mut names: Vec<String> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SystemDevices::default()),
        Err(e) => return Err(e),
    };
    names.sort();

    let mut devices = SystemDevices::default();
    for name in names {
        let path = dir.join(&name);
        if name == "lo" || !path.join("device").exists() {
            continue;
        }
        if path.join("wireless").exists() || path.join("phy80211").exists() {
            devices.wifi.push(name);
        } else {
            devices.ethernet.push(name);
        }
    }
    Ok(devices)
}

pub fn get_system_devices(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let devices = detect(&env.settings.sysfs_root).map_err(|e| {
        PipelineError::io(format!("scan {}", env.settings.sysfs_root.display()), e)
    })?;
    tracing::debug!(ethernet = ?devices.ethernet, wifi = ?devices.wifi, "system devices");
    update.cache.set(keys::DEVICES, CacheValue::Devices(devices));
    Ok(StepOutcome::Done)
}
