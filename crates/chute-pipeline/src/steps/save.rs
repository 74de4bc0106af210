//! Chute store steps. Each one persists immediately; undo writes back the
//! registry as it was before the update.

use chute_core::Chute;

use super::StepEnv;
use crate::error::Result;
use crate::step::StepOutcome;
use crate::update::Update;

pub fn put(update: &mut Update, env: &StepEnv, chute: &Chute) -> Result<StepOutcome> {
    env.store.put(chute.clone())?;
    update.progress(format!(
        "Saved chute {} version {} ({})",
        chute.name, chute.version, chute.state
    ));
    Ok(StepOutcome::Done)
}

pub fn delete(update: &mut Update, env: &StepEnv, name: &str) -> Result<StepOutcome> {
    env.store.delete(name)?;
    update.progress(format!("Deleted chute {name}"));
    Ok(StepOutcome::Done)
}

/// Put back `previous`, or forget `name` when it did not exist before.
pub fn restore(env: &StepEnv, name: &str, previous: Option<&Chute>) -> Result<StepOutcome> {
    match previous {
        Some(chute) => env.store.put(chute.clone())?,
        None => env.store.delete(name)?,
    }
    tracing::warn!(chute = %name, restored = previous.is_some(), "store entry rolled back");
    Ok(StepOutcome::Done)
}

pub fn clear(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let count = env.store.len();
    env.store.clear()?;
    update.progress(format!("Cleared {count} chute(s) from the store"));
    Ok(StepOutcome::Done)
}

pub fn restore_all(env: &StepEnv, chutes: &[Chute]) -> Result<StepOutcome> {
    env.store.replace_all(chutes.to_vec())?;
    tracing::warn!(count = chutes.len(), "store contents rolled back");
    Ok(StepOutcome::Done)
}
