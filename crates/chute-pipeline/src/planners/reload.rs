use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::update::{Update, UpdateClass};

/// Chute updates diff the written files first, which may narrow or skip the
/// reload. Host changes always reload; a factory reset unloads first.
pub fn plan(update: &mut Update, _ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) {
        return Ok(Verdict::Proceed);
    }
    match update.class() {
        UpdateClass::Chute => {
            update
                .plans
                .add(priority::CONFIG_DIFF, Step::DiffConfig, vec![])?;
        }
        UpdateClass::Router => {
            update
                .plans
                .add(priority::CONFIG_UNLOAD, Step::UnloadAll, vec![])?;
        }
        _ => {}
    }
    update
        .plans
        .add(priority::CONFIG_RELOAD, Step::ReloadAll, vec![])?;
    Ok(Verdict::Proceed)
}
