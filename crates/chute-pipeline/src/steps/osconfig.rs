//! OS config file writers.
//!
//! A writer replaces only the sections its owner generated and leaves every
//! other owner's sections untouched. The first write of a kind within an
//! update snapshots the file so the undo can put it back byte for byte.

use chute_core::fs::{read_optional, restore, write_atomic};

use super::StepEnv;
use crate::error::{PipelineError, Result};
use crate::step::StepOutcome;
use crate::uci::{ConfigFile, ConfigKind};
use crate::update::{snapshot_key, CacheValue, Update};

fn read(env: &StepEnv, kind: ConfigKind) -> Result<Option<String>> {
    let path = kind.path(&env.settings.os_config_dir);
    read_optional(&path).map_err(|e| PipelineError::io(format!("read {}", path.display()), e))
}

fn snapshot_once(update: &mut Update, kind: ConfigKind, text: &Option<String>) {
    if update.cache.snapshot(kind).is_none() {
        update
            .cache
            .set(snapshot_key(kind), CacheValue::Snapshot(text.clone()));
    }
}

fn store(env: &StepEnv, kind: ConfigKind, file: &ConfigFile) -> Result<()> {
    let path = kind.path(&env.settings.os_config_dir);
    write_atomic(&path, file.render().as_bytes())
        .map_err(|e| PipelineError::io(format!("write {}", path.display()), e))
}

pub fn write(update: &mut Update, env: &StepEnv, kind: ConfigKind) -> Result<StepOutcome> {
    let text = read(env, kind)?;
    snapshot_once(update, kind, &text);

    let mut file = ConfigFile::parse(text.as_deref().unwrap_or(""))?;
    let sections = update.cache.sections(kind).to_vec();
    let count = sections.len();
    file.replace_owned(update.owner(), sections);
    store(env, kind, &file)?;

    tracing::debug!(file = %kind, owner = %update.owner(), sections = count, "config written");
    Ok(StepOutcome::Done)
}

pub fn revert(update: &mut Update, env: &StepEnv, kind: ConfigKind) -> Result<StepOutcome> {
    let Some(before) = update.cache.snapshot(kind) else {
        return Ok(StepOutcome::Done);
    };
    let path = kind.path(&env.settings.os_config_dir);
    restore(&path, before)
        .map_err(|e| PipelineError::io(format!("restore {}", path.display()), e))?;
    tracing::warn!(file = %kind, "config reverted");
    Ok(StepOutcome::Done)
}

/// Drop every chute-owned section from all four files.
pub fn clear_chutes(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    for kind in ConfigKind::ALL {
        let text = read(env, kind)?;
        snapshot_once(update, kind, &text);
        let mut file = ConfigFile::parse(text.as_deref().unwrap_or(""))?;
        file.remove_chute_sections();
        store(env, kind, &file)?;
    }
    update.progress("Removed chute configuration");
    Ok(StepOutcome::Done)
}
