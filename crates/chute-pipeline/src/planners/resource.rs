use super::{nothing_to_plan, PlanContext, Verdict};
use crate::error::Result;
use crate::plan::priority;
use crate::step::Step;
use crate::update::{Update, UpdateClass, UpdateType};

/// Shares are only recomputed when containers are about to be (re)created.
pub fn plan(update: &mut Update, _ctx: &PlanContext) -> Result<Verdict> {
    if nothing_to_plan(update) || update.class() != UpdateClass::Chute {
        return Ok(Verdict::Proceed);
    }
    if matches!(
        update.kind(),
        UpdateType::Create | UpdateType::Update | UpdateType::Start | UpdateType::Restart
    ) {
        update
            .plans
            .add(priority::RESOURCE_GET_ALLOCATION, Step::ComputeResources, vec![])?;
    }
    Ok(Verdict::Proceed)
}
