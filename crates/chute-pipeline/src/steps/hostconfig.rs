//! Host configuration steps.

use chute_core::fs::{read_optional, restore as restore_file};
use chute_core::HostConfig;

use super::StepEnv;
use crate::error::{PipelineError, Result};
use crate::step::StepOutcome;
use crate::update::{keys, CacheValue, Update};

/// Cache the current host config, generating one from the devices when the
/// node has none yet.
pub fn get(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let config = match HostConfig::load_optional(&env.settings.host_config)? {
        Some(config) => config,
        None => {
            let devices = update.cache.devices().cloned().unwrap_or_default();
            tracing::info!("no host config on disk, generating defaults");
            HostConfig::generate(&devices.ethernet, &devices.wifi)
        }
    };
    update
        .cache
        .set(keys::HOST_CONFIG, CacheValue::HostConfig(Box::new(config)));
    Ok(StepOutcome::Done)
}

pub fn set(update: &mut Update, env: &StepEnv, config: &HostConfig) -> Result<StepOutcome> {
    let path = &env.settings.host_config;
    if !update.cache.contains(keys::HOST_CONFIG_SNAPSHOT) {
        let before = read_optional(path)
            .map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
        update
            .cache
            .set(keys::HOST_CONFIG_SNAPSHOT, CacheValue::Snapshot(before));
    }
    config.save(path)?;
    update
        .cache
        .set(keys::HOST_CONFIG, CacheValue::HostConfig(Box::new(config.clone())));
    update.progress("Saved host configuration");
    Ok(StepOutcome::Done)
}

pub fn reset(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let devices = update.cache.devices().cloned().unwrap_or_default();
    let config = HostConfig::generate(&devices.ethernet, &devices.wifi);
    set(update, env, &config)
}

pub fn restore(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let path = &env.settings.host_config;
    if let Some(CacheValue::Snapshot(before)) = update.cache.get(keys::HOST_CONFIG_SNAPSHOT) {
        restore_file(path, before.as_deref())
            .map_err(|e| PipelineError::io(format!("restore {}", path.display()), e))?;
        tracing::warn!(path = %path.display(), "host config restored");
    }
    Ok(StepOutcome::Done)
}
